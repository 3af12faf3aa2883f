use std::path::PathBuf;
use std::process::ExitCode;

use devtrackd::control;
use devtrackd::daemon::Paths;

#[tokio::main]
async fn main() -> ExitCode {
    let mut args: Vec<String> = std::env::args().skip(1).collect();
    let command = if args.is_empty() { String::new() } else { args.remove(0) };

    let profile_dir = std::env::var_os("DEVTRACK_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(control::default_profile_dir);
    let paths = Paths::new(profile_dir);

    // Only the daemon process itself redirects logging to a file; control
    // commands are short-lived and log to stdout.
    let log_target = (command == "start").then(|| paths.log_file());
    let _guard = match devtrackd::initialize_logging(log_target.as_deref()) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("\u{2717} failed to initialize logging: {e}");
            return ExitCode::FAILURE;
        }
    };

    let code = control::dispatch(&command, &args, &paths).await;
    ExitCode::from(code as u8)
}
