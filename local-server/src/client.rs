use crate::config::ClientConfig;
use amqp::auth::{ServiceBusSasConnectionStringCredential, TokenProvider};
use amqp::common::Context;
use amqp::connection::{Connection, ConnectionEvents, ConnectionOptions};
use amqp::message_receiver::{MessageReceiver, MessageReceiverEvents, MessageReceiverOptions};
use amqp::message_sender::{
    MessageSendStatus, MessageSender, MessageSenderEvents, MessageSenderOptions,
};
use amqp::models::{AmqpMessage, AmqpProperties, AmqpValue};
use amqp::session::{Session, SessionEvents, SessionOptions};
use anyhow::Context as _;
use std::sync::Arc;
use std::time::Duration;

struct ClientSession {
    connection: Connection,
    session: Session,
    credential: Option<Arc<dyn TokenProvider>>,
}

fn connect(config: &ClientConfig) -> anyhow::Result<ClientSession> {
    let address = format!("{}:{}", config.host(), config.port());
    let connection = Connection::new(
        &address,
        ConnectionOptions {
            enable_trace: config.enable_trace(),
            ..Default::default()
        },
        ConnectionEvents::new()
            .on_state_changed(|_, old, new| log::debug!("Connection {old} -> {new}"))
            .on_io_error(|connection, error| {
                log::error!("Connection to {} failed: {error}", connection.host());
            }),
    )
    .with_context(|| format!("Invalid address '{address}'"))?;
    let session = connection.create_session(SessionOptions::default(), SessionEvents::new())?;

    let credential = config
        .connection_string()
        .map(ServiceBusSasConnectionStringCredential::new)
        .transpose()
        .context("Invalid connection string")?
        .map(|credential| Arc::new(credential) as Arc<dyn TokenProvider>);

    Ok(ClientSession {
        connection,
        session,
        credential,
    })
}

/// Closes the connection and pumps it until the peer answers or `timeout` passes.
async fn disconnect(connection: &Connection, timeout: Duration) {
    if let Err(e) = connection.close("", "", AmqpProperties::new()) {
        log::debug!("Closing connection: {e}");
        return;
    }
    let deadline = tokio::time::Instant::now() + timeout;
    while !connection.state().is_terminal() && tokio::time::Instant::now() < deadline {
        if connection.poll().is_err() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

pub async fn send(config: &ClientConfig, target: &str, count: u32) -> anyhow::Result<()> {
    let client = connect(config)?;
    let ctx = Context::with_timeout(config.timeout());
    let sender = MessageSender::new(
        &client.session,
        target,
        MessageSenderOptions {
            credential: client.credential.clone(),
            enable_trace: config.enable_trace(),
            ..Default::default()
        },
        MessageSenderEvents::new().on_state_changed(|new, old| {
            log::debug!("Sender {old:?} -> {new:?}");
        }),
    )?;
    sender
        .open(&ctx)
        .await
        .with_context(|| format!("Failed to open sender to '{target}'"))?;

    let mut sent = 0;
    for index in 0..count {
        let message = AmqpMessage::with_value(format!("Message {} of {count}", index + 1))
            .set_message_id(AmqpValue::ULong(u64::from(index)))
            .set_application_property("sent-at", chrono::Utc::now().to_rfc3339().as_str());
        let (status, error) = sender.send(message, &ctx).await?;
        match (status, error) {
            (MessageSendStatus::Ok, _) => {
                sent += 1;
                println!("Sent message {} to '{target}'", index + 1);
            }
            (status, Some(error)) => println!("Message {} {status:?}: {error}", index + 1),
            (status, None) => println!("Message {} {status:?}", index + 1),
        }
    }
    println!("Sent {sent} of {count} message(s)");

    if let Err(e) = sender.close(&ctx).await {
        log::warn!("Failed to close sender: {e}");
    }
    disconnect(&client.connection, config.timeout()).await;
    Ok(())
}

pub async fn receive(config: &ClientConfig, source: &str, count: u32) -> anyhow::Result<()> {
    let client = connect(config)?;
    let ctx = Context::with_timeout(config.timeout());
    let receiver = MessageReceiver::new(
        &client.session,
        source,
        MessageReceiverOptions {
            credential: client.credential.clone(),
            max_link_credit: count.max(1),
            enable_trace: config.enable_trace(),
            ..Default::default()
        },
        MessageReceiverEvents::new(),
    )?;
    receiver
        .open(&ctx)
        .await
        .with_context(|| format!("Failed to open receiver from '{source}'"))?;

    let mut received = 0;
    while received < count {
        match receiver.wait_for_incoming_message(&ctx, &[]).await? {
            Some(message) => {
                received += 1;
                println!(
                    "Received {received}: id={:?} body={:?}",
                    message.properties.message_id, message.body
                );
            }
            None => {
                println!("Timed out after {received} of {count} message(s)");
                break;
            }
        }
    }

    if let Err(e) = receiver.close(&Context::with_timeout(config.timeout())).await {
        log::warn!("Failed to close receiver: {e}");
    }
    disconnect(&client.connection, config.timeout()).await;
    Ok(())
}
