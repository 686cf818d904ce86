//! Conversions between Kafka records and driver messages.

use broker_driver::Message;
use bytes::Bytes;
use rdkafka::message::{Header, Headers, Message as KafkaMessage, OwnedHeaders};
use std::collections::HashMap;

/// Copy a received Kafka record into a [`Message`].
///
/// Header values that are not valid UTF-8 are converted lossily; headers
/// without a value are kept with an empty one.
pub fn to_message<M: KafkaMessage>(record: &M) -> Message {
    let headers = record
        .headers()
        .map(|headers| {
            headers
                .iter()
                .map(|header| {
                    let value = header
                        .value
                        .map(|v| String::from_utf8_lossy(v).into_owned())
                        .unwrap_or_default();
                    (header.key.to_string(), value)
                })
                .collect::<HashMap<_, _>>()
        })
        .unwrap_or_default();

    Message::received(
        record.topic(),
        record.partition(),
        record.offset(),
        record.key().map(Bytes::copy_from_slice),
        record.payload().map(Bytes::copy_from_slice).unwrap_or_default(),
        headers,
    )
    .with_timestamp(record.timestamp().to_millis())
}

pub fn to_kafka_headers(headers: &HashMap<String, String>) -> OwnedHeaders {
    headers
        .iter()
        .fold(OwnedHeaders::new_with_capacity(headers.len()), |acc, (key, value)| {
            acc.insert(Header {
                key: key.as_str(),
                value: Some(value.as_bytes()),
            })
        })
}
