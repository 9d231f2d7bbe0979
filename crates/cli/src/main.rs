use std::process::ExitCode;

fn main() -> ExitCode {
    skipper_cli::run()
}
