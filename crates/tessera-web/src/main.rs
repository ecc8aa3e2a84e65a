use facet::Facet;
use figue as args;
use serde_json::Value;
use tessera_runtime::Inspector;
use tessera_web::client;
use tessera_web::config::ServerConfig;
use tessera_web::demo::{DEFAULT_TICK, run_demo};
use tessera_web::hub::Hub;
use tessera_web::transport::http::router;
use tessera_web::transport::stdio::run_stdio;
use tessera_web::transport::tcp::run_tcp_acceptor;
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Facet, Debug)]
struct ServerCli {
    #[facet(flatten)]
    builtins: args::FigueBuiltins,
    /// Serve a single session on stdin/stdout instead of listening.
    #[facet(args::named, default)]
    stdio: bool,
    /// Feed the inspector from the built-in demo app.
    #[facet(args::named, default)]
    demo: bool,
}

#[derive(Facet, Debug)]
struct ClientCli {
    #[facet(flatten)]
    builtins: args::FigueBuiltins,
    #[facet(args::subcommand)]
    command: ClientCommand,
}

#[derive(Facet, Debug)]
#[repr(u8)]
enum ClientCommand {
    Watch {
        #[facet(args::named, default)]
        addr: Option<String>,
        #[facet(args::named, default)]
        name: Option<String>,
        /// Comma-separated channel names.
        #[facet(args::named, default)]
        channels: Option<String>,
    },
    Call {
        #[facet(args::named, default)]
        addr: Option<String>,
        #[facet(args::named)]
        tool: String,
        /// Tool arguments as a JSON object.
        #[facet(args::named, default)]
        args: Option<String>,
    },
}

fn main() {
    let cli_args: Vec<String> = std::env::args().skip(1).collect();
    if cli_args
        .first()
        .map(String::as_str)
        .is_some_and(is_client_command)
    {
        if let Err(err) = run_client() {
            eprintln!("{err}");
            std::process::exit(1);
        }
        return;
    }

    ur_taking_me_with_you::die_with_parent();
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("failed to build tokio runtime")
        .block_on(async {
            if let Err(err) = run_server().await {
                eprintln!("{err}");
                std::process::exit(1);
            }
        });
}

fn is_client_command(value: &str) -> bool {
    matches!(value, "watch" | "call")
}

fn init_tracing() {
    // stdout may carry protocol frames, so logs always go to stderr.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();
}

fn parse_server_cli() -> Result<ServerCli, String> {
    let figue_config = args::builder::<ServerCli>()
        .map_err(|e| format!("failed to build CLI schema: {e}"))?
        .cli(|cli| cli.strict())
        .help(|h| {
            h.program_name("tessera")
                .description("Live tree inspector serving JSON-RPC over stdio, TCP, HTTP and WebSocket")
                .version(option_env!("CARGO_PKG_VERSION").unwrap_or("dev"))
        })
        .build();
    let cli = args::Driver::new(figue_config)
        .run()
        .into_result()
        .map_err(|e| e.to_string())?;
    Ok(cli.value)
}

fn parse_client_cli() -> Result<ClientCli, String> {
    let figue_config = args::builder::<ClientCli>()
        .map_err(|e| format!("failed to build CLI schema: {e}"))?
        .cli(|cli| cli.strict())
        .help(|h| {
            h.program_name("tessera")
                .description("Client commands for a running tessera server")
                .version(option_env!("CARGO_PKG_VERSION").unwrap_or("dev"))
        })
        .build();
    let cli = args::Driver::new(figue_config)
        .run()
        .into_result()
        .map_err(|e| e.to_string())?;
    Ok(cli.value)
}

fn run_client() -> Result<(), String> {
    let cli = parse_client_cli()?;
    init_tracing();
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(|e| format!("failed to build tokio runtime: {e}"))?;

    match cli.command {
        ClientCommand::Watch {
            addr,
            name,
            channels,
        } => {
            let addr = addr.unwrap_or_else(default_addr);
            let channels = channels.map(|list| {
                list.split(',')
                    .map(str::trim)
                    .filter(|c| !c.is_empty())
                    .map(str::to_string)
                    .collect()
            });
            let subscribe = client::watch_subscription(name, channels);
            runtime
                .block_on(client::watch(&addr, subscribe, |event| {
                    println!("{event}");
                }))
                .map_err(|e| format!("watch {addr}: {e}"))
        }
        ClientCommand::Call { addr, tool, args } => {
            let addr = addr.unwrap_or_else(default_addr);
            let arguments: Value = match args {
                Some(raw) => serde_json::from_str(&raw)
                    .map_err(|e| format!("--args is not valid JSON: {e}"))?,
                None => Value::Object(Default::default()),
            };
            let result = runtime
                .block_on(client::call(&addr, &tool, arguments))
                .map_err(|e| format!("call {tool} on {addr}: {e}"))?;
            let pretty = serde_json::to_string_pretty(&result)
                .map_err(|e| format!("encode result: {e}"))?;
            println!("{pretty}");
            Ok(())
        }
    }
}

fn default_addr() -> String {
    ServerConfig::from_env().listen_addr
}

async fn run_server() -> Result<(), String> {
    let cli = parse_server_cli()?;
    init_tracing();

    let config = ServerConfig::from_env();
    let options = config.stream_options();
    let (inspector, commits) = Inspector::new(config.inspector_config());
    let hub = Hub::new(inspector.clone(), config.governor_config(), config.deref_timeout);
    tokio::spawn(hub.clone().run(commits));

    if cli.demo {
        tokio::spawn(run_demo(inspector.clone(), DEFAULT_TICK));
    } else {
        warn!("no host attached; subscriptions will report empty until a commit arrives (pass --demo for a simulated app)");
    }

    if cli.stdio {
        info!(session = %inspector.session_id(), "serving on stdio");
        return run_stdio(hub, options)
            .await
            .map_err(|e| format!("stdio transport failed: {e}"));
    }

    let listener = TcpListener::bind(&config.listen_addr)
        .await
        .map_err(|e| format!("failed to bind TCP on {}: {e}", config.listen_addr))?;
    let http_listener = TcpListener::bind(&config.http_addr)
        .await
        .map_err(|e| format!("failed to bind HTTP on {}: {e}", config.http_addr))?;

    info!(
        listen = %config.listen_addr,
        http = %config.http_addr,
        session = %inspector.session_id(),
        "tessera ready"
    );
    print_startup_hints(&config, cli.demo);

    let app = router(hub.clone(), options);
    tokio::select! {
        _ = run_tcp_acceptor(listener, hub, options) => {}
        result = axum::serve(http_listener, app) => {
            if let Err(e) = result {
                error!(%e, "HTTP server error");
            }
        }
    }
    Ok(())
}

fn print_startup_hints(config: &ServerConfig, demo: bool) {
    let mode = if demo { "demo host" } else { "no host" };
    eprintln!();
    eprintln!("  tessera ready ({mode})");
    eprintln!();
    eprintln!("  Raw socket: \x1b[32m{}\x1b[0m", config.listen_addr);
    eprintln!("  JSON-RPC over HTTP: \x1b[32mhttp://{}/rpc\x1b[0m", config.http_addr);
    eprintln!("  Events (SSE): http://{}/events", config.http_addr);
    eprintln!("  WebSocket: ws://{}/ws", config.http_addr);
    eprintln!();
    eprintln!("  Watch with:");
    eprintln!("    \x1b[32mtessera watch --addr {}\x1b[0m", config.listen_addr);
    eprintln!();
}
