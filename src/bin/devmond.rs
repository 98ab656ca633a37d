use clap::Parser;

/// Device availability monitor daemon.
#[derive(Parser)]
#[command(name = "devmond", version, about)]
struct Cli {
    /// File descriptor to write `READY=1` to once the control socket is
    /// listening.
    ready_fd: Option<i32>,
}

fn main() {
    let cli = Cli::parse();
    devmon::telemetry::init();

    if let Err(e) = devmon::server::run(cli.ready_fd) {
        tracing::error!("{e}");
        std::process::exit(1);
    }
}
