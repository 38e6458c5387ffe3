//! # Bus Routing Integration Tests
//!
//! Writer and consumer wired over the in-memory broker: tag matching,
//! per-handler ordering, dropped envelopes, payload fidelity and decode
//! failures that stay local to one registration.

mod common;

use std::sync::Arc;

use anyhow::Result;

use common::{eventually, Occurrence, RecordingHandler, DESTINATION};
use harvester_core::context::{RunContext, SharedParameter};
use harvester_core::messaging::{InMemoryBroker, MessageBroker, MessageBusConsumer, MessageBusWriter, TagSet};
use harvester_core::pipeline::IterItemReader;
use harvester_core::step::{Step, StepContext, StreamStep};
use harvester_core::HarvesterError;

fn tags(values: &[&str]) -> TagSet {
    values.iter().copied().collect()
}

#[tokio::test]
async fn items_reach_every_matching_handler_in_publish_order() -> Result<()> {
    let broker: Arc<dyn MessageBroker> = Arc::new(InMemoryBroker::new());
    let consumer = MessageBusConsumer::new(broker.clone(), DESTINATION, 16);

    let a = RecordingHandler::<Occurrence>::new("a");
    let b = RecordingHandler::<Occurrence>::new("b");
    let c = RecordingHandler::<Occurrence>::new("c");
    consumer.register_handler(a.clone(), ["A"]).await?;
    consumer.register_handler(b.clone(), ["B"]).await?;
    consumer.register_handler(c.clone(), ["C"]).await?;
    consumer.open().await?;

    let writer = MessageBusWriter::connect(broker.clone(), DESTINATION).await?;
    let items = vec![
        Occurrence::new("1", "Acer rubrum", Some("CA")),
        Occurrence::new("2", "Betula papyrifera", None),
        Occurrence::new("3", "Carex aquatilis", Some("US")),
    ];
    for item in &items {
        writer.publish(item, &tags(&["A", "B"])).await?;
    }

    assert!(eventually(|| a.count() == 3 && b.count() == 3).await);
    assert_eq!(a.received(), items);
    assert_eq!(b.received(), items);
    assert_eq!(c.count(), 0);

    let stats = consumer.stats();
    assert_eq!(stats.received, 3);
    assert_eq!(stats.routed, 3);
    assert_eq!(stats.dropped, 0);

    consumer.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn envelopes_without_a_matching_handler_are_dropped() -> Result<()> {
    let broker: Arc<dyn MessageBroker> = Arc::new(InMemoryBroker::new());
    let consumer = MessageBusConsumer::new(broker.clone(), DESTINATION, 16);
    let a = RecordingHandler::<Occurrence>::new("a");
    consumer.register_handler(a.clone(), ["A"]).await?;
    consumer.open().await?;

    let writer = MessageBusWriter::connect(broker, DESTINATION).await?;
    writer
        .publish(&Occurrence::new("1", "Acer rubrum", None), &tags(&["D"]))
        .await?;
    writer
        .publish(&Occurrence::new("2", "Acer saccharum", None), &tags(&["A", "D"]))
        .await?;

    assert!(eventually(|| consumer.stats().received == 2).await);
    assert!(eventually(|| a.count() == 1).await);
    let stats = consumer.stats();
    assert_eq!(stats.dropped, 1);
    assert_eq!(stats.routed, 1);
    assert_eq!(a.received()[0].id, "2");

    consumer.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn each_delivery_decodes_an_independent_copy() -> Result<()> {
    let broker: Arc<dyn MessageBroker> = Arc::new(InMemoryBroker::new());
    let consumer = MessageBusConsumer::new(broker.clone(), DESTINATION, 16);
    let first = RecordingHandler::<Occurrence>::new("first");
    let second = RecordingHandler::<Occurrence>::new("second");
    consumer.register_handler(first.clone(), ["A"]).await?;
    consumer.register_handler(second.clone(), ["A"]).await?;
    consumer.open().await?;

    let original = Occurrence::new("occ-42", "Picea glauca", Some("CA"));
    let writer = MessageBusWriter::connect(broker, DESTINATION).await?;
    writer.publish(&original, &tags(&["A"])).await?;

    assert!(eventually(|| first.count() == 1 && second.count() == 1).await);
    assert_eq!(first.received()[0], original);
    assert_eq!(second.received()[0], original);

    consumer.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn stream_without_destinations_fails_before_publishing() -> Result<()> {
    let broker: Arc<dyn MessageBroker> = Arc::new(InMemoryBroker::new());
    let writer = MessageBusWriter::connect(broker.clone(), DESTINATION).await?;

    let mut stream = StreamStep::<Occurrence>::new("occurrence_stream");
    stream.set_reader(IterItemReader::new(vec![Occurrence::new("1", "Acer rubrum", None)]));
    stream.set_writer(writer.clone());

    let context = StepContext::new(Arc::new(
        RunContext::builder()
            .with(SharedParameter::ResourceId, "vascan")
            .build(),
    ));
    let err = stream.prepare(&context).await.unwrap_err();
    assert!(matches!(err, HarvesterError::Configuration { .. }));
    stream.finalize().await?;

    assert_eq!(writer.published_count(), 0);
    assert_eq!(broker.destination_stats(DESTINATION).await?.total_published, 0);
    Ok(())
}

#[tokio::test]
async fn decode_failure_in_one_handler_does_not_block_the_others() -> Result<()> {
    let broker: Arc<dyn MessageBroker> = Arc::new(InMemoryBroker::new());
    let consumer = MessageBusConsumer::new(broker.clone(), DESTINATION, 16);
    let counts = RecordingHandler::<u32>::new("counts");
    let names = RecordingHandler::<String>::new("names");
    let counts_id = consumer.register_handler(counts.clone(), ["A"]).await?;
    let names_id = consumer.register_handler(names.clone(), ["A"]).await?;
    consumer.open().await?;

    let writer = MessageBusWriter::connect(broker, DESTINATION).await?;
    writer.publish(&"Acer rubrum", &tags(&["A"])).await?;
    writer.publish(&"Betula nana", &tags(&["A"])).await?;

    assert!(eventually(|| names.count() == 2).await);
    assert_eq!(names.received(), vec!["Acer rubrum", "Betula nana"]);
    assert!(eventually(|| {
        consumer
            .handler_stats(counts_id)
            .is_some_and(|stats| stats.decode_failures == 2)
    })
    .await);
    assert_eq!(counts.count(), 0);

    let names_stats = consumer.handler_stats(names_id).unwrap();
    assert_eq!(names_stats.succeeded, 2);
    assert_eq!(names_stats.decode_failures, 0);

    consumer.shutdown().await?;
    Ok(())
}
