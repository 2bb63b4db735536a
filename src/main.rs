use std::process::ExitCode;

fn main() -> ExitCode {
    match forge_replay_lib::run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            eprintln!("error: {error}");
            ExitCode::FAILURE
        }
    }
}
