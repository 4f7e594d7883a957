use amqp::auth::{ConnectionStringCredential, SasTokenGenerator};
use amqp::common::{AsyncOperationQueue, Registry};
use base64::{Engine as _, engine::general_purpose};
use chrono::{DateTime, Duration, Utc};
use proptest::prelude::*;

fn expiry(seconds: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(seconds, 0).unwrap()
}

mod connection_string_properties {
    use super::*;

    proptest! {
        #[test]
        fn test_parsed_fields_match_input(
            host in "[a-z][a-z0-9]{0,15}\\.servicebus\\.windows\\.net",
            key_name in "[A-Za-z][A-Za-z0-9]{0,20}",
            key in prop::collection::vec(any::<u8>(), 1..64),
            entity in "[a-z][a-z0-9-]{0,20}"
        ) {
            let key = general_purpose::STANDARD.encode(key);
            let connection_string = format!(
                "Endpoint=sb://{host}/;SharedAccessKeyName={key_name};SharedAccessKey={key};EntityPath={entity}"
            );
            let credential = ConnectionStringCredential::new(&connection_string).unwrap();

            prop_assert_eq!(credential.host_name(), host.as_str());
            prop_assert_eq!(credential.port(), 5671);
            prop_assert_eq!(credential.shared_access_key_name(), key_name.as_str());
            prop_assert_eq!(credential.shared_access_key(), key.as_str());
            prop_assert_eq!(credential.entity_path(), entity.as_str());
            prop_assert_eq!(credential.connection_string(), connection_string.as_str());
        }

        #[test]
        fn test_missing_endpoint_is_rejected(
            key_name in "[A-Za-z]{1,10}",
            key in "[A-Za-z0-9]{4,20}"
        ) {
            let connection_string = format!("SharedAccessKeyName={key_name};SharedAccessKey={key}");
            prop_assert!(ConnectionStringCredential::new(&connection_string).is_err());
        }

        #[test]
        fn test_parse_errors_do_not_echo_segments(secret in "[0-9][A-Za-z0-9]{7,31}") {
            let connection_string = format!("Endpoint=sb://host/;{secret}");
            let err = ConnectionStringCredential::new(&connection_string).unwrap_err();
            prop_assert!(!err.to_string().contains(&secret));
        }
    }
}

mod sas_token_properties {
    use super::*;

    proptest! {
        #[test]
        fn test_token_is_deterministic(
            resource in "amqps://[a-z]{1,12}/[a-z]{1,12}",
            key in prop::collection::vec(any::<u8>(), 1..64),
            seconds in 1_000_000_000i64..4_000_000_000
        ) {
            let key = general_purpose::STANDARD.encode(key);
            let generator = SasTokenGenerator::new(resource);
            let first = generator.generate_sas_token("policy", &key, expiry(seconds)).unwrap();
            let second = generator.generate_sas_token("policy", &key, expiry(seconds)).unwrap();

            prop_assert_eq!(&first, &second);
            prop_assert!(first.starts_with("SharedAccessSignature sr="));
            let expected_expiry = format!("&se={seconds}&");
            prop_assert!(first.contains(&expected_expiry));
        }

        #[test]
        fn test_one_second_changes_signature(
            key in prop::collection::vec(any::<u8>(), 1..64),
            seconds in 1_000_000_000i64..4_000_000_000
        ) {
            let key = general_purpose::STANDARD.encode(key);
            let generator = SasTokenGenerator::new("amqps://host/queue");
            let earlier = generator.generate_sas_token("policy", &key, expiry(seconds)).unwrap();
            let later = generator
                .generate_sas_token("policy", &key, expiry(seconds) + Duration::seconds(1))
                .unwrap();
            prop_assert_ne!(earlier, later);
        }
    }
}

mod queue_properties {
    use super::*;

    proptest! {
        #[test]
        fn test_fifo_queue_preserves_order(values in prop::collection::vec(any::<u32>(), 0..100)) {
            let queue = AsyncOperationQueue::fifo();
            for value in &values {
                queue.complete_operation(*value);
            }
            prop_assert_eq!(queue.len(), values.len());
            let drained: Vec<u32> = std::iter::from_fn(|| queue.try_take()).collect();
            prop_assert_eq!(drained, values);
        }

        #[test]
        fn test_single_slot_keeps_latest(values in prop::collection::vec(any::<u32>(), 1..50)) {
            let queue = AsyncOperationQueue::new();
            for value in &values {
                queue.complete_operation(*value);
            }
            prop_assert_eq!(queue.len(), 1);
            prop_assert_eq!(queue.try_take(), values.last().copied());
        }
    }
}

mod registry_properties {
    use super::*;

    proptest! {
        #[test]
        fn test_removed_handles_never_resolve(count in 1usize..64, removals in prop::collection::vec(any::<prop::sample::Index>(), 0..32)) {
            let mut registry = Registry::new();
            let handles: Vec<_> = (0..count).map(|i| registry.insert(i)).collect();

            let mut removed = Vec::new();
            for index in removals {
                let handle = handles[index.index(count)];
                if registry.remove(handle).is_some() {
                    removed.push(handle);
                }
            }
            // Reuse freed slots; stale handles must still miss.
            for i in 0..removed.len() {
                registry.insert(count + i);
            }

            for handle in &removed {
                prop_assert!(registry.get(*handle).is_none());
            }
            for (i, handle) in handles.iter().enumerate() {
                if !removed.contains(handle) {
                    prop_assert_eq!(registry.get(*handle), Some(&i));
                }
            }
            prop_assert_eq!(registry.len(), count);
        }
    }
}
