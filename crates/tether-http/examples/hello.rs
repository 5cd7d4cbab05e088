use anyhow::Error;
use tether_http::HttpServer;
use tether_mio::{
    net::{IpVersion, DEFAULT_BACKLOG},
    start_service, RunMode,
};
use tracing::{event, Level};
use tracing_subscriber::FmtSubscriber;

const RESPONSE: &str = "<html><body><h1>Hello, World!</h1></body></html>";

fn main() -> Result<(), Error> {
    let subscriber = FmtSubscriber::builder()
        .with_env_filter("info")
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let server = HttpServer::new();

    server.events().listening.listen(|addr| {
        event!(Level::INFO, ?addr, "listening");
    });
    server.events().error.listen(|error| {
        event!(Level::ERROR, %error, "server error");
    });
    server.events().client_connected.listen(|connection| {
        connection.events().request_made.listen(|(request, response)| {
            event!(Level::INFO, method = %request.method, path = %request.path, "request");

            response.close_when_writes_completed();
            if response.send_status(200).is_ok() {
                response.add_header("Content-Type", "text/html");
                let _ = response.end_with(RESPONSE);
            }
        });
    });

    server.listen_on(8080, IpVersion::V4, DEFAULT_BACKLOG)?;

    start_service(RunMode::Single)?;

    Ok(())
}
