//! bash, bash_output and kill_shell

use super::types::{
    BashInput, BashOutput, BashOutputInput, BashOutputOutput, KillShellInput, KillShellOutput,
    ToolError, ToolErrorCode,
};
use super::workspace::Workspace;
use crate::error::RuntimeError;
use crate::shell::{ShellExecutor, ShellOutcome, ShellRequest};
use tokio_util::sync::CancellationToken;

fn shell_error(err: RuntimeError) -> ToolError {
    match err {
        RuntimeError::UnknownShell(id) => {
            ToolError::new(ToolErrorCode::NotFound, format!("No background shell '{}'", id))
                .with_hint("Background ids are returned by bash with runInBackground")
        }
        RuntimeError::Validation(message) => ToolError::invalid_input(message),
        RuntimeError::Io(e) => ToolError::new(
            ToolErrorCode::ExecutionFailed,
            format!("Failed to start command: {}", e),
        )
        .with_hint("Check that the shell is installed and the working directory exists"),
        other => ToolError::new(ToolErrorCode::ExecutionFailed, other.to_string()),
    }
}

pub(super) async fn bash(
    workspace: &Workspace,
    shell: &ShellExecutor,
    input: &BashInput,
    cancel: CancellationToken,
) -> Result<BashOutput, ToolError> {
    if input.timeout == Some(0) {
        return Err(ToolError::invalid_input("timeout must be greater than 0"));
    }
    let cwd = match &input.cwd {
        Some(cwd) => workspace.resolve(cwd)?,
        None => workspace.root().to_path_buf(),
    };
    if !cwd.is_dir() {
        return Err(ToolError::new(
            ToolErrorCode::NotFound,
            format!("Working directory {} does not exist", workspace.display_path(&cwd)),
        ));
    }

    let request = ShellRequest {
        command: input.command.clone(),
        timeout_ms: input.timeout,
        cwd: Some(cwd),
        run_in_background: input.run_in_background,
    };

    match shell.execute(&request, cancel).await.map_err(shell_error)? {
        ShellOutcome::Completed(out) => Ok(BashOutput {
            stdout: out.stdout,
            stderr: out.stderr,
            exit_code: Some(out.exit_code),
            bash_id: None,
            timed_out: out.timed_out,
        }),
        ShellOutcome::Background { bash_id } => Ok(BashOutput {
            stdout: String::new(),
            stderr: String::new(),
            exit_code: None,
            bash_id: Some(bash_id),
            timed_out: false,
        }),
    }
}

pub(super) async fn bash_output(
    shell: &ShellExecutor,
    input: &BashOutputInput,
) -> Result<BashOutputOutput, ToolError> {
    let out = shell
        .registry()
        .output(&input.bash_id, input.filter.as_deref())
        .await
        .map_err(shell_error)?;
    Ok(BashOutputOutput {
        stdout: out.stdout,
        stderr: out.stderr,
        exit_code: out.state.exit_code(),
        running: out.state.is_running(),
    })
}

pub(super) async fn kill_shell(
    shell: &ShellExecutor,
    input: &KillShellInput,
) -> Result<KillShellOutput, ToolError> {
    let killed = shell
        .registry()
        .kill(&input.bash_id)
        .await
        .map_err(shell_error)?;
    Ok(KillShellOutput {
        bash_id: input.bash_id.clone(),
        killed,
    })
}
