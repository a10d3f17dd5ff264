//! xpdadm - admin tool for xproofd daemons
//!
//! Logs in as an administrative client and issues one request per
//! invocation, printing the daemon's reply.

use clap::Parser;
use tracing::debug;

use xpd_client::cli::{Args, Command};
use xpd_client::{Connection, LoginParams};
use xpd_protocol::{Response, Role, SendRcvBody};
use xpd_utils::{init_logging_with_config, LogConfig, Result, XpdError};

fn print_reply(resp: &Response) {
    let text = resp.text();
    let text = text.trim_end_matches('\0');
    if !text.is_empty() {
        println!("{}", text);
    }
}

/// Report server messages that arrived while waiting for the reply
fn print_notices(conn: &mut Connection) {
    for attn in conn.drain_attn() {
        let payload = attn.attn_payload();
        let text = String::from_utf8_lossy(&payload);
        eprintln!("{}", text.trim_end_matches('\0'));
    }
}

fn check(resp: Response) -> Result<Response> {
    match resp.error_info() {
        Some((code, message)) => Err(XpdError::Remote { code, message }),
        None => Ok(resp),
    }
}

async fn run(args: Args) -> Result<()> {
    let mut conn = Connection::new(args.addr.clone()).with_timeout(args.request_timeout());
    conn.connect().await?;
    debug!("connected to {} (daemon version {:?})", args.addr, conn.server_version());
    conn.login(&LoginParams::new(args.login_user(), Role::Admin)).await?;

    if let Some(call) = args.command.admin_call() {
        let resp = conn.admin(call.kind, call.sid, call.int2, call.payload).await?;
        print_notices(&mut conn);
        print_reply(&resp);
    } else if let Some((body, payload)) = args.command.read_call() {
        let resp = check(conn.read_buffer(body, payload).await?)?;
        print_reply(&resp);
    } else if let Command::Ping { sid: Some(sid) } = args.command {
        let resp = check(conn.ping(SendRcvBody { sid, ..Default::default() }).await?)?;
        let alive = resp.int_at(0) == Some(1);
        println!("session {}: {}", sid, if alive { "alive" } else { "no answer" });
    } else {
        println!("{} is alive (protocol {})", args.addr, conn.server_version().unwrap_or(0));
    }

    conn.disconnect().await;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let log = match &args.log {
        Some(filter) => LogConfig::client().with_filter(filter.clone()),
        None => LogConfig::client(),
    };
    init_logging_with_config(log)?;

    if let Err(e) = run(args).await {
        eprintln!("Error: {}", e);
        return Err(e);
    }
    Ok(())
}
