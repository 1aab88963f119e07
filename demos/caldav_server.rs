//
//  Sample CalDAV server.
//
//  Serves an in-memory calendar store on localhost, plain http.
//  Every user gets a home at /user/<name>/ with a calendar, an
//  inbox and an outbox. The first user is the logged-in principal.
//
//  Usage:
//    cargo run --example caldav-server -- --user alice --user bob
//

use std::convert::Infallible;
use std::error::Error;
use std::net::SocketAddr;

use clap::Parser;
use hyper::{server::conn::http1, service::service_fn};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;

use caldav_handler::{CalDavHandler, memstore::MemStore};

#[derive(Debug, clap::Parser)]
#[clap(about, version)]
struct Cli {
    /// port to listen on
    #[clap(short = 'p', long, default_value = "5232")]
    port: u16,
    /// user accounts to create
    #[clap(short = 'u', long = "user", default_value = "alice")]
    users: Vec<String>,
    /// URL prefix to strip off
    #[clap(long, default_value = "")]
    prefix: String,
    /// maximum size of a calendar object in bytes
    #[clap(long)]
    max_size: Option<u64>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();

    let args = Cli::parse();

    let store = MemStore::new();
    for user in &args.users {
        store.add_user(user);
    }
    if let Some(size) = args.max_size {
        store.set_max_entity_size(size);
    }
    let me = args.users.first().map(|u| u.as_str());
    store.set_current_principal(me);

    let mut config = CalDavHandler::builder().store(store).strip_prefix(args.prefix.clone());
    if let Some(me) = me {
        config = config.principal(format!("/principals/users/{me}"));
    }
    let dav_server = config.build_handler();

    let addr = SocketAddr::from(([127, 0, 0, 1], args.port));
    let listener = TcpListener::bind(addr).await?;

    println!("CalDAV server listening on {addr}");
    for user in &args.users {
        println!("  calendar home: http://{addr}{}/user/{user}/", args.prefix);
    }
    println!("  CalWS endpoint: http://{addr}{}/calws/soap", args.prefix);

    loop {
        let (stream, _) = listener.accept().await?;
        let dav_server = dav_server.clone();

        let io = TokioIo::new(stream);

        tokio::task::spawn(async move {
            let service = service_fn(move |req| {
                let dav_server = dav_server.clone();
                async move { Ok::<_, Infallible>(dav_server.handle(req).await) }
            });
            if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
                eprintln!("Failed serving connection: {err:?}");
            }
        });
    }
}
