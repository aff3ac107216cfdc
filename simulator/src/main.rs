use anyhow::Result;
use clap::Parser;
use std::net::SocketAddr;
use std::sync::Arc;
use terrapulse_simulator::{Api, Simulator, SimulatorConfig};
use terrapulse_types::TerritoryRow;
use tracing::info;

#[derive(Parser, Debug)]
#[command(
    name = "terrapulse-simulator",
    about = "In-memory terrapulse backend for development and tests."
)]
struct Args {
    /// Address to listen on.
    #[arg(long, default_value = "127.0.0.1:4000")]
    listen: SocketAddr,
    /// Seed a demo game on startup.
    #[arg(long)]
    seed_demo: bool,
    /// Action-point cap for the seeded demo game.
    #[arg(long, default_value_t = 10)]
    demo_ap_cap: u32,
}

fn read_env_bool(var: &str, default: bool) -> bool {
    match std::env::var(var).as_deref() {
        Ok("1") | Ok("true") | Ok("TRUE") | Ok("yes") | Ok("YES") => true,
        Ok("0") | Ok("false") | Ok("FALSE") | Ok("no") | Ok("NO") => false,
        _ => default,
    }
}

fn config_from_env() -> SimulatorConfig {
    SimulatorConfig {
        refuse_changes: read_env_bool("TERRAPULSE_REFUSE_CHANGES", false),
        fail_queries: read_env_bool("TERRAPULSE_FAIL_QUERIES", false),
    }
}

fn seed_demo(simulator: &Simulator, ap_cap: u32) {
    simulator.create_game("demo", ap_cap);
    for (id, name, armies) in [("T1", "Alpha", 3), ("T2", "Bravo", 2), ("T3", "Charlie", 4)] {
        simulator.put_territory(
            "demo",
            TerritoryRow {
                territory_id: id.to_string(),
                territory_name: name.to_string(),
                owner_name: None,
                armies,
            },
        );
    }
    info!(game_id = "demo", ap_cap, "seeded demo game");
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    let args = Args::parse();
    let simulator = Arc::new(Simulator::new(config_from_env()));
    if args.seed_demo {
        seed_demo(&simulator, args.demo_ap_cap);
    }

    let api = Api::new(simulator.clone());
    let listener = tokio::net::TcpListener::bind(args.listen).await?;
    info!(listen = %args.listen, "simulator listening");
    axum::serve(listener, api.router()).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn args_parse_with_defaults() {
        let args = Args::parse_from(["simulator"]);
        assert_eq!(args.listen, "127.0.0.1:4000".parse::<SocketAddr>().unwrap());
        assert!(!args.seed_demo);
        assert_eq!(args.demo_ap_cap, 10);
    }

    #[test]
    fn env_bool_parsing_falls_back_to_default() {
        assert!(!read_env_bool("TERRAPULSE_TEST_UNSET_FLAG", false));
        assert!(read_env_bool("TERRAPULSE_TEST_UNSET_FLAG", true));
    }
}
