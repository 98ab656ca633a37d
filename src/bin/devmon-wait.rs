use clap::Parser;

/// Wait for a device watched by the monitor daemon.
///
/// Blocks until the device is available, writes `READY=1` to the given
/// file descriptor, then keeps running until the device disappears.
#[derive(Parser)]
#[command(name = "devmon-wait", version, about)]
struct Cli {
    /// Device descriptor: a /dev or /sys path, `netif:NAME`, `mac:ADDR`,
    /// `usb:VENDOR:PRODUCT`, or a LABEL=/UUID=/PARTLABEL=/PARTUUID=/ID=
    /// tag.
    device: String,
    /// File descriptor to signal readiness on.
    ready_fd: i32,
}

fn main() {
    let cli = Cli::parse();
    devmon::telemetry::init();

    if let Err(e) = devmon::client::run(&cli.device, cli.ready_fd) {
        tracing::error!("{e}");
        std::process::exit(1);
    }
}
