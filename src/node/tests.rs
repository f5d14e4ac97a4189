//! Node Module Tests
//!
//! Validates the wire protocol shape, framing, payload encryption,
//! configuration fail-fast checks, and end-to-end convergence between real
//! nodes on the loopback interface.

#[cfg(test)]
mod tests {
    use crate::node::crypto::PayloadCipher;
    use crate::node::protocol::{self, WireMessage};
    use crate::node::service::{GossipNode, dead_probe_probability};
    use crate::node::transport::{read_frame, write_frame};
    use crate::node::types::{GossipConfig, GossipEvent};
    use crate::reconcile::{Delta, Digest};
    use serde_json::json;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;
    use tokio::io::AsyncWriteExt;

    fn test_config(port: u16) -> GossipConfig {
        GossipConfig {
            port,
            gossip_interval: Duration::from_millis(100),
            heartbeat_interval: Duration::from_millis(100),
            ..GossipConfig::default()
        }
    }

    async fn wait_until(what: &str, mut check: impl FnMut() -> bool) {
        for _ in 0..100 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!("timed out waiting for {}", what);
    }

    /// Collects every event a node emits into a shared vector.
    fn record_events(node: &GossipNode) -> Arc<Mutex<Vec<GossipEvent>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let mut events = node.subscribe();
        tokio::spawn(async move {
            while let Ok(event) = events.recv().await {
                let stop = matches!(event, GossipEvent::Stop);
                sink.lock().unwrap().push(event);
                if stop {
                    break;
                }
            }
        });
        seen
    }

    // ============================================================
    // WIRE MESSAGE TESTS
    // ============================================================

    #[test]
    fn test_request_carries_digest_only() {
        let mut digest = Digest::new();
        digest.insert("127.0.0.1:9000".to_string(), 3);

        let json = serde_json::to_value(WireMessage::request(digest)).unwrap();
        assert_eq!(json["t"], protocol::REQUEST);
        assert_eq!(json["d"]["127.0.0.1:9000"], 3);
        assert!(json.get("r").is_none());
        assert!(json.get("u").is_none());
    }

    #[test]
    fn test_empty_response_fields_are_omitted() {
        let message = WireMessage::first_response(Digest::new(), vec![]);
        let json = serde_json::to_value(&message).unwrap();
        assert_eq!(json["t"], protocol::FIRST_RESPONSE);
        assert!(json.get("r").is_none(), "empty request map must be omitted");
        assert!(json.get("u").is_none(), "empty delta list must be omitted");

        let parsed: WireMessage = serde_json::from_value(json).unwrap();
        assert!(parsed.r.is_none() && parsed.u.is_none());
    }

    #[test]
    fn test_second_response_round_trip() {
        let deltas = vec![Delta {
            peer: "127.0.0.1:9000".to_string(),
            key: "k".to_string(),
            value: json!("v"),
            version: 2,
            expires_at: Some(123),
        }];

        let encoded = serde_json::to_vec(&WireMessage::second_response(deltas.clone())).unwrap();
        let parsed: WireMessage = serde_json::from_slice(&encoded).unwrap();
        assert_eq!(parsed.t, protocol::SECOND_RESPONSE);
        assert_eq!(parsed.u.unwrap(), deltas);
    }

    // ============================================================
    // FRAMING TESTS
    // ============================================================

    #[tokio::test]
    async fn test_frame_round_trip() {
        let (mut client, mut server) = tokio::io::duplex(4096);

        write_frame(&mut client, b"hello gossip").await.unwrap();
        let frame = read_frame(&mut server).await.unwrap();
        assert_eq!(frame.as_deref(), Some(&b"hello gossip"[..]));
    }

    #[tokio::test]
    async fn test_frame_eof_before_header_is_clean() {
        let (client, mut server) = tokio::io::duplex(64);
        drop(client);
        assert!(read_frame(&mut server).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_frame_rejects_oversized_length() {
        let (mut client, mut server) = tokio::io::duplex(64);
        let oversized: u32 = 64 * 1024 * 1024;
        client.write_all(&oversized.to_be_bytes()).await.unwrap();

        assert!(read_frame(&mut server).await.is_err());
    }

    // ============================================================
    // ENCRYPTION TESTS
    // ============================================================

    #[test]
    fn test_cipher_round_trip() {
        let cipher = PayloadCipher::new(Some("Preshared_Network_Key"));
        assert!(cipher.is_enabled());

        let sealed = cipher.seal(b"payload").unwrap();
        assert_ne!(sealed, b"payload", "ciphertext must differ from plaintext");
        assert_eq!(cipher.open(&sealed).unwrap(), b"payload");
    }

    #[test]
    fn test_cipher_rejects_wrong_key_and_garbage() {
        let sender = PayloadCipher::new(Some("key-one"));
        let receiver = PayloadCipher::new(Some("key-two"));

        let sealed = sender.seal(b"payload").unwrap();
        assert!(receiver.open(&sealed).is_err());
        assert!(receiver.open(b"short").is_err());
    }

    #[test]
    fn test_cipher_disabled_is_identity() {
        let cipher = PayloadCipher::new(None);
        assert!(!cipher.is_enabled());
        assert_eq!(cipher.seal(b"clear").unwrap(), b"clear");
        assert_eq!(cipher.open(b"clear").unwrap(), b"clear");
    }

    // ============================================================
    // CONFIGURATION TESTS
    // ============================================================

    #[test]
    fn test_zero_port_fails_fast() {
        let config = GossipConfig::default();
        assert!(GossipNode::new(config).is_err());
    }

    #[tokio::test]
    async fn test_self_seed_fails_fast() {
        let mut config = test_config(29351);
        config.seeds = vec!["127.0.0.1:29351".to_string()];

        let node = GossipNode::new(config).unwrap();
        let error = node.start().await.unwrap_err();
        assert!(error.to_string().contains("self as seed"));
    }

    #[test]
    fn test_suspicion_timeouts_derive_from_gossip_interval() {
        let config = test_config(29361);
        assert_eq!(config.suspect_after(), Duration::from_millis(400));
        assert_eq!(config.dead_after(), Duration::from_millis(800));
        assert_eq!(config.default_event_ttl(), Duration::from_millis(800));
    }

    #[test]
    fn test_add_peer_rejects_self_and_duplicates() {
        let node = GossipNode::new(test_config(29371)).unwrap();

        assert!(!node.add_peer("127.0.0.1:29371"), "self must be rejected");
        assert!(node.add_peer("127.0.0.1:29372"));
        assert!(!node.add_peer("127.0.0.1:29372"), "duplicate is a no-op");
        assert_eq!(node.known_peers(), vec!["127.0.0.1:29372".to_string()]);
    }

    #[test]
    fn test_address_map_rewrites_added_peers() {
        let mut config = test_config(29381);
        config
            .address_map
            .insert("10.9.9.9".to_string(), "127.0.0.1".to_string());

        let node = GossipNode::new(config).unwrap();
        assert!(node.add_peer("10.9.9.9:29382"));
        assert_eq!(node.known_peers(), vec!["127.0.0.1:29382".to_string()]);
    }

    // ============================================================
    // PEER SELECTION TESTS
    // ============================================================

    #[test]
    fn test_dead_probe_probability_shape() {
        assert_eq!(dead_probe_probability(0, 0), 0.0);
        assert_eq!(dead_probe_probability(5, 0), 0.0);
        assert_eq!(dead_probe_probability(1, 1), 0.5);
        assert_eq!(dead_probe_probability(3, 2), 0.5);
        assert!(
            dead_probe_probability(1, 10) >= 1.0,
            "a mostly dead network must always probe"
        );
    }

    // ============================================================
    // END-TO-END TESTS (loopback)
    // ============================================================

    #[tokio::test]
    async fn test_two_nodes_discover_and_converge() {
        let a = GossipNode::new(test_config(29301)).unwrap();
        let mut config_b = test_config(29302);
        config_b.seeds = vec!["127.0.0.1:29301".to_string()];
        let b = GossipNode::new(config_b).unwrap();

        let seen_at_b = record_events(&b);

        a.set("alpha", json!("from-a"));
        a.start().await.unwrap();
        b.start().await.unwrap();

        // B pulls A's state; A discovers B from B's digest and pulls back.
        wait_until("b to learn a's key", || {
            b.remote_value("127.0.0.1:29301", "alpha") == Some(json!("from-a"))
        })
        .await;
        wait_until("a to discover b", || {
            a.known_peers().contains(&"127.0.0.1:29302".to_string())
        })
        .await;

        // The first accepted update from A must have raised exactly one
        // peer-alive observation at B.
        let alive_count = seen_at_b
            .lock()
            .unwrap()
            .iter()
            .filter(|event| {
                matches!(event, GossipEvent::PeerAlive { peer } if peer.as_str() == "127.0.0.1:29301")
            })
            .count();
        assert_eq!(alive_count, 1);

        assert!(a.live_peers().contains(&"127.0.0.1:29302".to_string()));

        a.stop();
        b.stop();
    }

    #[tokio::test]
    async fn test_say_is_heard_with_originating_peer() {
        let a = GossipNode::new(test_config(29311)).unwrap();
        let mut config_b = test_config(29312);
        config_b.seeds = vec!["127.0.0.1:29311".to_string()];
        let b = GossipNode::new(config_b).unwrap();

        let heard = Arc::new(Mutex::new(None));
        let sink = heard.clone();
        b.hear("ping", move |value, peer| {
            *sink.lock().unwrap() = Some((value, peer));
        });

        a.start().await.unwrap();
        b.start().await.unwrap();

        wait_until("b to join a", || {
            a.known_peers().contains(&"127.0.0.1:29312".to_string())
        })
        .await;

        a.say("ping", json!({"n": 1}));

        wait_until("b to hear the event", || heard.lock().unwrap().is_some()).await;
        let (value, peer) = heard.lock().unwrap().clone().unwrap();
        assert_eq!(value, json!({"n": 1}));
        assert_eq!(peer, "127.0.0.1:29311");

        a.stop();
        b.stop();
    }

    #[tokio::test]
    async fn test_tcp_only_nodes_converge() {
        let mut config_a = test_config(29321);
        config_a.udp = false;
        let a = GossipNode::new(config_a).unwrap();

        let mut config_b = test_config(29322);
        config_b.udp = false;
        config_b.seeds = vec!["127.0.0.1:29321".to_string()];
        let b = GossipNode::new(config_b).unwrap();

        a.set("framed", json!(true));
        a.start().await.unwrap();
        b.start().await.unwrap();

        wait_until("b to learn a's key over tcp", || {
            b.remote_value("127.0.0.1:29321", "framed") == Some(json!(true))
        })
        .await;

        a.stop();
        b.stop();
    }

    #[tokio::test]
    async fn test_encrypted_nodes_converge() {
        let mut config_a = test_config(29331);
        config_a.network_key = Some("Preshared_Network_Key".to_string());
        let a = GossipNode::new(config_a).unwrap();

        let mut config_b = test_config(29332);
        config_b.network_key = Some("Preshared_Network_Key".to_string());
        config_b.seeds = vec!["127.0.0.1:29331".to_string()];
        let b = GossipNode::new(config_b).unwrap();

        a.set("secret", json!(42));
        a.start().await.unwrap();
        b.start().await.unwrap();

        wait_until("b to learn a's key under encryption", || {
            b.remote_value("127.0.0.1:29331", "secret") == Some(json!(42))
        })
        .await;

        a.stop();
        b.stop();
    }

    #[tokio::test]
    async fn test_believe_adopts_peer_value() {
        let a = GossipNode::new(test_config(29341)).unwrap();
        let mut config_b = test_config(29342);
        config_b.seeds = vec!["127.0.0.1:29341".to_string()];
        let b = GossipNode::new(config_b).unwrap();

        b.believe("shared");
        a.set("shared", json!("consensus"));

        a.start().await.unwrap();
        b.start().await.unwrap();

        wait_until("b to adopt the believed value", || {
            b.get("shared") == Some(json!("consensus"))
        })
        .await;

        a.stop();
        b.stop();
    }

    #[tokio::test]
    async fn test_expired_key_emits_event_and_disappears() {
        let node = GossipNode::new(test_config(29391)).unwrap();
        let seen = record_events(&node);

        node.start().await.unwrap();
        node.set_expiring("tmp", json!("soon gone"), Duration::from_millis(50));
        assert_eq!(node.get("tmp"), Some(json!("soon gone")));

        wait_until("the entry to expire", || {
            seen.lock()
                .unwrap()
                .iter()
                .any(|event| matches!(event, GossipEvent::Expire { key, .. } if key.as_str() == "tmp"))
        })
        .await;
        assert_eq!(node.get("tmp"), None);

        node.stop();
    }
}
