use clap::Parser;

fn main() -> anyhow::Result<()> {
    let cfg = fidolink::config::Config::parse();
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(async {
            match cfg.command {
                fidolink::config::Command::Wipe => fidolink::wipe(cfg).await,
                _ => fidolink::run(cfg).await,
            }
        })
}
