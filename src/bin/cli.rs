use clap::Parser;
use respconn::{BoxError, Command, Config, Connection, Reply};
use tokio::net::TcpStream;
use tokio::time::{Duration, Instant};
use tracing::debug;

const HOST: &str = "127.0.0.1";
const PORT: u16 = 6379;

/// Sends one command to a RESP server and prints the reply.
#[derive(Parser, Debug)]
struct Args {
    /// The host to connect to
    #[arg(long, env = "RESPCONN_HOST", default_value = HOST)]
    host: String,

    /// The port to connect to
    #[arg(short, long, env = "RESPCONN_PORT", default_value_t = PORT)]
    port: u16,

    /// Give up waiting for the reply after this many milliseconds
    #[arg(short, long, env = "RESPCONN_TIMEOUT_MS")]
    timeout_ms: Option<u64>,

    /// The command name followed by its arguments
    #[arg(required = true, trailing_var_arg = true)]
    command: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    let _ = tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|e| debug!("Failed to initialize global tracing: {}", e));

    let args = Args::parse();

    let stream = TcpStream::connect((args.host.as_str(), args.port)).await?;
    let mut conn = Connection::with_config(stream, Config::from_env());

    if let Some(timeout) = args.timeout_ms {
        conn.set_deadline(Some(Instant::now() + Duration::from_millis(timeout)));
    }

    let mut words = args.command.into_iter();
    let name = words.next().ok_or("missing command name")?;
    let cmd = Command::new(name).args(words);

    let reply = conn.cmd(&cmd).await;
    println!("{}", reply);

    // Closing is best effort, the reply was already printed.
    let _ = conn.close().await;

    match reply {
        Reply::Error(err) if !err.is_server() => Err(err.into()),
        _ => Ok(()),
    }
}
