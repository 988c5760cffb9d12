use std::sync::Arc;

use anyhow::Context;
use tokio::sync::broadcast;
use trail_queue::amqp::AmqpBroker;
use trail_queue::config::{Role, Settings};
use trail_queue::consumer::{self, Consumer, ConsumerOptions};
use trail_queue::Telemetry;

fn main() -> anyhow::Result<()> {
    let settings = Settings::load(Role::Consumer).context("could not load configuration")?;
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
    let mut brokers = Vec::with_capacity(settings.consumer_workers);
    for _ in 0..settings.consumer_workers {
        let broker = AmqpBroker::connect(&settings.amqp_url)
            .await
            .context("failed to connect to RabbitMQ")?;
        brokers.push(Arc::new(broker));
    }

    let (shutdown, _) = broadcast::channel(1);
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

    let consumers = brokers
        .iter()
        .map(|broker| {
            Consumer::new(
                Arc::clone(broker),
                Arc::clone(&telemetry),
                ConsumerOptions::from(settings),
            )
        })
        .collect();

    log::info!(workers = settings.consumer_workers; "waiting for messages, press ctrl-c to exit");
    let report = consumer::run_workers(consumers, &shutdown).await;
    for broker in &brokers {
        broker.close().await;
    }

    let report = report.context("consumer failed")?;
    log::info!(processed = report.processed, rejected = report.rejected; "done");
    Ok(())
}
