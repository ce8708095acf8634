use std::io;
use std::net::Ipv4Addr;

use tracing::Instrument;

use fastcgi_mux::server::{Acceptor, Request};
use fastcgi_mux::{Config, Error};


/// Echoes the request body back, together with a few request parameters.
/// Requests from clients that keep their connection open are pipelined.
async fn handler(mut request: Request) -> Result<(), Error> {
    if request.head().method() == "GET" {
        request.set_header("content-type", "text/plain")?;
        let url = request.head().url().to_owned();
        request.write(format!("Hello from {url}\n").as_bytes()).await?;
        return request.respond().await;
    }

    let mut body = Vec::new();
    request.read_to_end(&mut body).await?;
    let ctype = request.head().content_type().unwrap_or("application/octet-stream").to_owned();
    request.set_header("content-type", &ctype)?;
    request.set_header("x-powered-by", "fastcgi-mux-echo")?;
    request.write(&body).await?;
    request.respond().await
}


#[tokio::main(flavor = "current_thread")]
async fn main() -> io::Result<()> {
    init_tracing();

    let mut acceptor = Acceptor::new(Config::default());
    let addr = acceptor.add_listener(tokio::net::TcpListener::bind((Ipv4Addr::LOCALHOST, 9000)).await?)?;
    tracing::info!(%addr, "FastCGI echo server listening");

    let quit = quit();
    tokio::pin!(quit);
    loop {
        let request = tokio::select! {
            r = &mut quit => {
                r?;
                break;
            },
            request = acceptor.accept() => request,
        };
        let Some(request) = request else { break };

        let span = tracing::info_span!("request", id = request.request_id(), url = request.head().url());
        tokio::spawn(async move {
            match handler(request).await {
                Ok(()) => tracing::debug!("request completed"),
                Err(Error::Aborted) => tracing::info!("request aborted by client"),
                Err(e) => tracing::error!(error = %e, "request failed"),
            }
        }.instrument(span));
    }

    tracing::info!("shutting down");
    acceptor.shutdown().await;
    Ok(())
}


/// Waits for a signal to shut the FastCGI server down.
#[cfg(not(unix))]
fn quit() -> impl std::future::Future<Output = io::Result<()>> {
    tokio::signal::ctrl_c()
}

/// Waits for a signal to shut the FastCGI server down.
#[cfg(unix)]
async fn quit() -> io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};
    let mut term = signal(SignalKind::terminate())?;
    tokio::select! {
        r = tokio::signal::ctrl_c() => r,
        _ = term.recv() => Ok(()),
    }
}


/// Sets up a basic `tracing` subscriber to stderr. Its verbosity level is
/// configured with the `RUST_LOG` environment variable.
fn init_tracing() {
    use tracing_subscriber::{filter::LevelFilter, fmt};
    let max_level = match std::env::var("RUST_LOG") {
        Ok(var) if !var.is_empty() => var.parse::<LevelFilter>().unwrap_or_else(|e| {
            eprintln!("Ignoring `RUST_LOG={var}`: {e}");
            LevelFilter::INFO
        }),
        _ => LevelFilter::INFO,
    };

    fmt::fmt()
        .with_timer(fmt::time::uptime())
        .with_max_level(max_level)
        .with_writer(std::io::stderr)
        .init();
}
