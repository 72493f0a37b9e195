use clap::Parser;
use progman::pm::errors::PortInUse;

fn main() {
    let args = progman::pm::cli::Args::parse();
    let code = match run(args) {
        Ok(()) => 0,
        Err(e) if e.downcast_ref::<PortInUse>().is_some() => {
            eprintln!("progman: {e}");
            2
        }
        Err(e) => {
            eprintln!("progman: {e:#}");
            1
        }
    };
    std::process::exit(code);
}

fn run(args: progman::pm::cli::Args) -> anyhow::Result<()> {
    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    rt.block_on(progman::pm::daemon::run_daemon_async(args.config))
}
