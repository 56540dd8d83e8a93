//! Region lookup round trip.
//!
//! With no `BROKER_URI` set (or `BROKER_URI=memory://`) a small in-process
//! DDD service answers the lookups. Against RabbitMQ the resolver service is
//! expected to be running already:
//!
//! ```text
//! cargo run --example region_lookup -- 11987654321 21912345678 99900000000
//! BROKER_URI=amqp://localhost:5672/%2f RUST_LOG=region_rpc=debug \
//!     cargo run --example region_lookup -- 11987654321
//! ```

use region_rpc::{
    //
    connect,
    AsyncRpcClient,
    RegionReply,
    RegionRequest,
    RegionResolver,
    Result,
    RpcClient,
    RpcConfig,
    RpcServer,
    NOT_FOUND_REGION,
};
use tracing_subscriber::EnvFilter;

fn ddd_service(req: RegionRequest) -> Option<RegionReply> {
    // ---
    let region = match req.phone.get(..2) {
        Some("11") => "São Paulo",
        Some("21") => "Rio de Janeiro",
        Some("31") => "Belo Horizonte",
        Some("61") => "Distrito Federal",
        Some("71") => "Salvador",
        _ => NOT_FOUND_REGION,
    };
    Some(RegionReply {
        region: Some(region.to_string()),
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    // ---
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let config = match std::env::var("BROKER_URI") {
        Ok(_) => RpcConfig::from_env("contacts")?,
        Err(_) => RpcConfig::memory("contacts"),
    };

    let transport = connect(&config).await?;

    let server = if config.broker_uri.starts_with("memory://") {
        Some(RpcServer::spawn_json(transport.clone(), &config, ddd_service)?)
    } else {
        None
    };

    let timeout = config.request_timeout;
    let max_workers = config.max_workers;
    let resolver = RegionResolver::new(
        AsyncRpcClient::new(RpcClient::new(transport.clone(), config), max_workers),
        timeout,
    );

    let mut phones: Vec<String> = std::env::args().skip(1).collect();
    if phones.is_empty() {
        phones = vec!["11987654321".into(), "99912345678".into()];
    }

    for phone in &phones {
        match resolver.resolve_region(phone).await.into_region() {
            Ok(region) => println!("{phone}: {region}"),
            Err(rejection) if rejection.is_server_error() => {
                println!("{phone}: lookup failed ({:?})", rejection.reason())
            }
            Err(rejection) => println!("{phone}: {rejection}"),
        }
    }

    if let Some(server) = server {
        server.shutdown()?;
    }
    transport.close().await?;
    Ok(())
}
