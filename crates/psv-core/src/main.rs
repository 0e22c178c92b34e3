use clap::Parser;
use psv_core::cli::{self, Cli};

fn main() {
    let code = cli::run(Cli::parse());
    std::process::exit(code.as_i32());
}
