//! Tests for the job model.

use super::*;
use chrono::TimeZone;
use serde_json::json;

mod name_validation {
    use super::*;

    #[test]
    fn test_valid_topic_names() {
        assert!(TopicName::new("orders").is_ok());
        assert!(TopicName::new("orders.v2_bulk-1").is_ok());
        assert!(TopicName::new("scratch#ephemeral").is_ok());
    }

    #[test]
    fn test_invalid_topic_names() {
        assert!(TopicName::new("").is_err());
        assert!(TopicName::new("has space").is_err());
        assert!(TopicName::new("a".repeat(65)).is_err());
        assert!(TopicName::new("#ephemeral").is_err());
        assert!(ChannelName::new("slash/name").is_err());
    }

    #[test]
    fn test_dead_letter_topic() {
        let topic = TopicName::new("k").unwrap();
        let dead_letter = topic.dead_letter().unwrap();
        assert_eq!(dead_letter.as_str(), "k-dlq");
        assert!(dead_letter.is_dead_letter());
        assert!(!topic.is_dead_letter());
    }

    /// Verify a topic at the length limit cannot produce a dead-letter topic.
    #[test]
    fn test_dead_letter_topic_respects_length_limit() {
        let topic = TopicName::new("t".repeat(63)).unwrap();
        assert!(topic.dead_letter().is_err());
    }

    #[test]
    fn test_message_id_from_broker_bytes() {
        let id = MessageId::from_bytes(b"0a1b2c3d4e5f6789");
        assert_eq!(id.as_str(), "0a1b2c3d4e5f6789");
        assert!("".parse::<MessageId>().is_err());
        assert_ne!(MessageId::new(), MessageId::new());
    }
}

mod delay_computation {
    use super::*;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn test_absent_time_means_no_delay() {
        assert_eq!(compute_delay(None, now()), Duration::ZERO);
    }

    #[test]
    fn test_past_time_means_no_delay() {
        let at = now() - chrono::Duration::seconds(30);
        assert_eq!(compute_delay(Some(at), now()), Duration::ZERO);
        assert_eq!(compute_delay(Some(now()), now()), Duration::ZERO);
    }

    #[test]
    fn test_future_time_is_difference() {
        let at = now() + chrono::Duration::seconds(90);
        assert_eq!(compute_delay(Some(at), now()), Duration::from_secs(90));
    }

    /// Verify a job scheduled 90s ahead yields a delay between 89s and 91s.
    #[test]
    fn test_job_delay_from_wall_clock() {
        let job = Job::new("fill", vec![]).with_at(Utc::now() + chrono::Duration::seconds(90));

        let delay = job.delay_from(Utc::now()).unwrap();

        assert!(delay >= Duration::from_secs(89), "delay was {:?}", delay);
        assert!(delay <= Duration::from_secs(91), "delay was {:?}", delay);
    }

    #[test]
    fn test_non_utc_offsets_are_honoured() {
        let mut job = Job::new("fill", vec![]);
        job.at = Some("2024-05-01T14:01:30+02:00".to_string());

        let delay = job.delay_from(now()).unwrap();

        assert_eq!(delay, Duration::from_secs(90));
    }

    #[test]
    fn test_unparseable_time_is_schedule_error() {
        let mut job = Job::new("fill", vec![]);
        job.at = Some("next tuesday".to_string());

        let result = job.delay_from(now());

        assert!(matches!(result, Err(JobError::InvalidSchedule { .. })));
        assert!(job.validate().is_err());
    }
}

mod serialization {
    use super::*;

    #[test]
    fn test_round_trip_with_schedule() {
        let job = Job::new("fill", vec![json!(1), json!("two"), json!({"three": 3})])
            .with_queue("k")
            .with_custom("bid", json!("b-123"))
            .with_at(Utc.with_ymd_and_hms(2024, 5, 1, 12, 5, 1).unwrap());

        let decoded = Job::from_bytes(&job.to_bytes().unwrap()).unwrap();

        assert_eq!(decoded, job);
        assert_eq!(decoded.at.as_deref(), Some("2024-05-01T12:05:01.000000000Z"));
    }

    /// Verify an absent schedule is omitted on the wire and stays absent.
    #[test]
    fn test_round_trip_without_schedule() {
        let job = Job::new("fill", vec![json!(1)]).with_queue("k");

        let bytes = job.to_bytes().unwrap();
        let wire: Value = serde_json::from_slice(&bytes).unwrap();
        let decoded = Job::from_bytes(&bytes).unwrap();

        assert!(wire.get("at").is_none());
        assert_eq!(wire["type"], json!("fill"));
        assert_eq!(decoded, job);
        assert_eq!(decoded.at, None);
    }

    #[test]
    fn test_lenient_decoding_of_empty_fields() {
        let bytes = br#"{"queue":"k","type":"fill","args":null,"custom":null,"at":""}"#;

        let job = Job::from_bytes(bytes).unwrap();

        assert!(job.args.is_empty());
        assert!(job.custom.is_empty());
        assert_eq!(job.at, None);
    }

    #[test]
    fn test_malformed_payload_is_serialization_error() {
        let result = Job::from_bytes(b"{not json");
        assert!(matches!(result, Err(JobError::Serialization(_))));
    }
}

mod construction {
    use super::*;

    #[test]
    fn test_defaults() {
        let job = Job::new("fill", vec![json!(1)]);
        assert_eq!(job.queue, DEFAULT_QUEUE);
        assert_eq!(job.dead_letter_queue(), "default-dlq");
        assert!(job.custom("missing").is_none());
        assert!(job.validate().is_ok());
    }

    #[test]
    fn test_empty_queue_is_rejected() {
        let job = Job::new("fill", vec![]).with_queue("");
        assert!(matches!(job.validate(), Err(JobError::Validation(_))));
    }

    #[test]
    fn test_empty_type_is_accepted() {
        let job = Job::new("", vec![]).with_queue("k");
        assert!(job.validate().is_ok());
    }
}
