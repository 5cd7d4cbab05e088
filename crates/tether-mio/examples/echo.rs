use anyhow::Error;
use tether_mio::{
    net::{IpVersion, NetServer, NetStream, ReadMode, DEFAULT_BACKLOG},
    start_service, RunMode,
};
use tracing::{event, Level};
use tracing_subscriber::FmtSubscriber;

fn main() -> Result<(), Error> {
    let subscriber = FmtSubscriber::builder()
        .with_env_filter("debug")
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let server = NetServer::new();

    server.events().listening.listen(|addr| {
        event!(Level::INFO, ?addr, "listening");
    });
    server.events().error.listen(|error| {
        event!(Level::ERROR, %error, "server error");
    });
    server.events().connection.listen(|stream: &NetStream| {
        event!(Level::INFO, "stream accepted");
        stream.events().error.listen(|error| {
            event!(Level::ERROR, %error, "stream error");
        });

        let echo = stream.clone();
        stream.events().data_received.listen(move |(data, _eof)| {
            let reply = format!(
                "HELLO, \"{}\"!\n",
                String::from_utf8_lossy(data).trim()
            );
            if let Err(error) = echo.write_async(reply) {
                event!(Level::WARN, %error, "echo failed");
            }
        });

        if let Err(error) = stream.write_async("HELLO WORLD\n") {
            event!(Level::WARN, %error, "greeting failed");
        }
        stream.set_read_mode(ReadMode::Newline);
        let _ = stream.read_async();
    });

    server.listen(1234, IpVersion::V4, DEFAULT_BACKLOG)?;

    // Run the event loop
    start_service(RunMode::Single)?;

    Ok(())
}
