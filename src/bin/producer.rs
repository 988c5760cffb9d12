use std::sync::Arc;

use anyhow::Context;
use tokio::sync::broadcast;
use trail_queue::amqp::AmqpBroker;
use trail_queue::config::{Role, Settings};
use trail_queue::producer::{Producer, ProducerOptions};
use trail_queue::Telemetry;

fn main() -> anyhow::Result<()> {
    let settings = Settings::load(Role::Producer).context("could not load configuration")?;
    let telemetry = Arc::new(trail_queue::init(&settings, env!("CARGO_PKG_VERSION"))?);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("could not build runtime")?;
    let result = runtime.block_on(run(&settings, Arc::clone(&telemetry)));
    drop(runtime);

    if let Err(err) = telemetry.shutdown() {
        log::error!(error:% = err; "failed to shut down tracer provider");
    }

    result
}

async fn run(settings: &Settings, telemetry: Arc<Telemetry>) -> anyhow::Result<()> {
    let broker = Arc::new(
        AmqpBroker::connect(&settings.amqp_url)
            .await
            .context("failed to connect to RabbitMQ")?,
    );

    let (shutdown, receiver) = broadcast::channel(1);
    let signal = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                log::info!("interrupt received");
                let _ = signal.send(());
            }
            Err(err) => log::warn!(error:% = err; "could not listen for interrupts"),
        }
    });

    let producer = Producer::new(
        Arc::clone(&broker),
        telemetry,
        ProducerOptions::from(settings),
    );
    let report = producer.run(receiver).await;
    drop(shutdown);
    broker.close().await;

    let report = report.context("producer failed")?;
    log::info!(published = report.published, failed = report.failed; "done");
    Ok(())
}
