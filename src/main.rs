use anyhow::Result;

use redflow_bridge::{config, daemon, serial};

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    env_logger::init();
    let matches = config::parse_args();

    if matches.get_flag("list-ports") {
        for (name, port_type) in serial::enumerate_ports() {
            println!("{name}\t{port_type}");
        }
        return Ok(());
    }

    let config = config::Config::from_matches(&matches)?;
    daemon::run(config).await
}
