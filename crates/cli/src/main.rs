use std::process::ExitCode;

fn main() -> ExitCode {
    despacho_cli::run()
}
