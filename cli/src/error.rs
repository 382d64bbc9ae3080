use std::process::ExitCode;

pub type RunResult<T> = anyhow::Result<T>;

/// Map the run outcome to a process exit status, reporting failures
/// with their cause chain on stderr
pub fn exit_status(result: RunResult<()>) -> ExitCode {
    let Err(e) = result else {
        return ExitCode::SUCCESS;
    };
    eprintln!("gatewired: {e}");
    for cause in e.chain().skip(1) {
        eprintln!("  because: {cause}");
    }
    ExitCode::FAILURE
}
