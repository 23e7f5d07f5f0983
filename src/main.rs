use clap::Parser;

use credible::{
    cli::{run, stderr_line, Cli},
    logging,
};

fn main() {
    let cli = Cli::parse();
    logging::init(cli.verbose);
    match run(cli) {
        Ok(code) => std::process::exit(code),
        Err(error) => {
            stderr_line(&error.diagnostic());
            std::process::exit(error.exit_code());
        }
    }
}
