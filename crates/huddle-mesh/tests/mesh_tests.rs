#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;
    use std::future::Future;
    use std::sync::Arc;
    use std::time::Duration;

    use huddle_config::LogCatalogEntry;
    use huddle_core::{
        COORDINATOR_NAME, CredentialTable, HuddleError, LogRecord, ParticipantProfile, Severity,
    };
    use huddle_mesh::credential::hash_credential;
    use huddle_mesh::transport::EVENT_CHANNEL_CAPACITY;
    use huddle_mesh::*;
    use parking_lot::Mutex;
    use serde_json::{Value, json};

    const COORD_ADDR: &str = "coord";
    const COORD_PORT: u16 = 2428;
    const KEY: &str = "Passable";

    /// Poll `check` until it holds or two seconds pass.
    async fn eventually<F: Fn() -> bool>(what: &str, check: F) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while !check() {
            if tokio::time::Instant::now() > deadline {
                panic!("timed out waiting for {what}");
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Let in-flight events settle.
    async fn settle() {
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    fn coordinator_settings() -> CoordinatorSettings {
        CoordinatorSettings {
            listen_address: COORD_ADDR.into(),
            port: COORD_PORT,
            access_key: KEY.into(),
            // Tests drive planning by hand.
            plan_interval: Duration::from_secs(3600),
            ..Default::default()
        }
    }

    async fn start_coordinator(
        net: &MemoryNetwork,
        settings: CoordinatorSettings,
        sink: Option<Arc<dyn LogSink>>,
    ) -> (Arc<Coordinator>, MemoryTransport) {
        let (transport, events) = net.transport(COORDINATOR_NAME);
        let mut coordinator = Coordinator::new(settings, Arc::new(transport.clone()));
        if let Some(sink) = sink {
            coordinator = coordinator.with_sink(sink);
        }
        let coordinator = Arc::new(coordinator);
        coordinator.start(events).await.unwrap();
        (coordinator, transport)
    }

    fn settings(name: &str, segment: &str) -> ParticipantSettings {
        let mut s = ParticipantSettings::new(name, COORD_ADDR, COORD_PORT, KEY, format!("lan-{name}"));
        s.segment = segment.into();
        s.reconnect_interval = Duration::from_millis(50);
        s
    }

    async fn join(net: &MemoryNetwork, settings: ParticipantSettings) -> Arc<Participant> {
        let name = settings.name.clone();
        Participant::start(settings, net.transport(&name).into(), net.transport(&name).into())
            .await
            .unwrap()
    }

    async fn linked_pair(net: &MemoryNetwork) -> (Arc<Coordinator>, Arc<Participant>, Arc<Participant>) {
        let (coord, _) = start_coordinator(net, coordinator_settings(), None).await;
        let a = join(net, settings("A", "X")).await;
        let b = join(net, settings("B", "X")).await;
        eventually("presence", || coord.registry().len() == 2).await;
        coord.plan_and_dispatch().await;
        eventually("link A-B", || a.is_linked("B") && b.is_linked("A")).await;
        (coord, a, b)
    }

    fn timeout<F: Future>(f: F) -> tokio::time::Timeout<F> {
        tokio::time::timeout(Duration::from_secs(2), f)
    }

    // ── Presence ───────────────────────────────────────────────

    #[tokio::test]
    async fn test_presence_registers_full_profile() {
        let net = MemoryNetwork::new();
        let (coord, _) = start_coordinator(&net, coordinator_settings(), None).await;
        let mut s = settings("A", "X");
        s.public_address = "1.2.3.4".into();
        s.blacklist = BTreeSet::from(["Z".to_string()]);
        let a = join(&net, s).await;

        eventually("presence", || coord.registry().get("A").is_some()).await;
        let profile = coord.registry().get("A").unwrap();
        assert_eq!(profile, a.profile());
        assert_eq!(profile.listen_port, a.listen_port());
        assert_eq!(profile.access_key.len(), 16);
        assert!(profile.is_public);
        assert_eq!(profile.segment_id, "X");
    }

    #[tokio::test]
    async fn test_disconnect_removes_presence() {
        let net = MemoryNetwork::new();
        let (coord, _) = start_coordinator(&net, coordinator_settings(), None).await;
        let a = join(&net, settings("A", "X")).await;
        eventually("presence", || coord.registry().len() == 1).await;

        a.shutdown().await;
        eventually("removal", || coord.registry().is_empty()).await;
    }

    #[tokio::test]
    async fn test_reserved_name_is_refused() {
        let net = MemoryNetwork::new();
        let result = Participant::start(
            settings(COORDINATOR_NAME, "X"),
            net.transport(COORDINATOR_NAME).into(),
            net.transport(COORDINATOR_NAME).into(),
        )
        .await;
        assert!(matches!(result, Err(HuddleError::InvalidProfile { .. })));
    }

    #[tokio::test]
    async fn test_participant_reconnects_to_coordinator() {
        let net = MemoryNetwork::new();
        let (coord, coord_transport) = start_coordinator(&net, coordinator_settings(), None).await;
        let a = join(&net, settings("A", "X")).await;
        eventually("presence", || coord.registry().len() == 1).await;

        coord_transport.disconnect("A").await;
        eventually("reconnect", || net.dial_count("A", COORDINATOR_NAME) == 2).await;
        eventually("presence again", || coord.registry().get("A").is_some()).await;
        assert!(a.is_coordinator_connected());
    }

    #[tokio::test]
    async fn test_shutdown_stops_reconnect_loop() {
        let net = MemoryNetwork::new();
        let a = join(&net, settings("A", "X")).await;
        assert!(!a.is_coordinator_connected());
        a.shutdown().await;

        let (coord, _) = start_coordinator(&net, coordinator_settings(), None).await;
        settle().await;
        assert_eq!(net.dial_count("A", COORDINATOR_NAME), 0);
        assert!(coord.registry().is_empty());
    }

    #[tokio::test]
    async fn test_rejected_presence_does_not_block_event_loop() {
        let net = MemoryNetwork::new();
        let (transport, mut events) = net.transport(COORDINATOR_NAME);
        transport.listen(COORD_ADDR, COORD_PORT, KEY).await.unwrap();
        let coord = Coordinator::new(coordinator_settings(), Arc::new(transport.clone()));

        let (impostor, _impostor_events) = net.transport(COORDINATOR_NAME);
        impostor
            .connect(COORDINATOR_NAME, COORD_ADDR, COORD_PORT, KEY)
            .await
            .unwrap();
        // Connected took one slot; fill the rest of the coordinator's channel.
        for i in 0..EVENT_CHANNEL_CAPACITY - 1 {
            impostor
                .send(COORDINATOR_NAME, &Frame::Data(json!(i)))
                .await
                .unwrap();
        }

        let announce = Frame::from(Command::PresenceAnnounce(ParticipantProfile::new(
            COORDINATOR_NAME,
            "lan",
            4000,
            "k",
        )));
        timeout(coord.handle_event(LinkEvent::Message {
            from: COORDINATOR_NAME.into(),
            frame: announce,
        }))
        .await
        .expect("handling a rejected presence must not wait on the event channel");
        assert!(coord.registry().is_empty());

        let mut closed = false;
        while let Ok(Some(event)) = timeout(events.recv()).await {
            if matches!(event, LinkEvent::Disconnected { .. }) {
                closed = true;
                break;
            }
        }
        assert!(closed);
        assert!(!transport.is_connected(COORDINATOR_NAME));
    }

    #[tokio::test]
    async fn test_participant_waits_for_late_coordinator() {
        let net = MemoryNetwork::new();
        let a = join(&net, settings("A", "X")).await;
        assert!(!a.is_coordinator_connected());

        let (coord, _) = start_coordinator(&net, coordinator_settings(), None).await;
        eventually("late presence", || coord.registry().get("A").is_some()).await;
    }

    // ── Planning loop ──────────────────────────────────────────

    #[tokio::test(start_paused = true)]
    async fn test_planning_loop_period_and_debounce() {
        let net = MemoryNetwork::new();
        let mut cs = coordinator_settings();
        cs.plan_interval = Duration::from_secs(30);
        cs.debounce = Duration::from_secs(20);
        let start = tokio::time::Instant::now();
        let at = |secs: u64| start + Duration::from_secs(secs);

        let (coord, _) = start_coordinator(&net, cs, None).await;
        let a = join(&net, settings("A", "X")).await;
        let b = join(&net, settings("B", "X")).await;
        eventually("presence", || coord.registry().len() == 2).await;

        // First cycle after one interval.
        tokio::time::sleep_until(at(29)).await;
        assert_eq!(coord.cycles(), 0);
        assert!(!a.is_linked("B"));
        tokio::time::sleep_until(at(31)).await;
        assert_eq!(coord.cycles(), 1);
        eventually("directive link", || a.is_linked("B") && b.is_linked("A")).await;

        // Registry unchanged: interval plus debounce.
        tokio::time::sleep_until(at(79)).await;
        assert_eq!(coord.cycles(), 1);
        tokio::time::sleep_until(at(81)).await;
        assert_eq!(coord.cycles(), 2);

        // A new presence before the next tick skips the debounce.
        let c = join(&net, settings("C", "X")).await;
        eventually("third presence", || coord.registry().len() == 3).await;
        tokio::time::sleep_until(at(109)).await;
        assert_eq!(coord.cycles(), 2);
        tokio::time::sleep_until(at(111)).await;
        assert_eq!(coord.cycles(), 3);
        eventually("third links", || c.peers().len() == 2).await;
    }

    // ── Directives ─────────────────────────────────────────────

    #[tokio::test]
    async fn test_same_segment_pair_links() {
        let net = MemoryNetwork::new();
        let (_coord, a, b) = linked_pair(&net).await;
        assert_eq!(a.peers(), vec!["B".to_string()]);
        assert_eq!(b.peers(), vec!["A".to_string()]);
        assert_eq!(net.dial_count("A", "B"), 1);
        assert_eq!(net.dial_count("B", "A"), 0);
    }

    #[tokio::test]
    async fn test_repeated_directive_keeps_single_link() {
        let net = MemoryNetwork::new();
        let (coord, a, _b) = linked_pair(&net).await;

        let plan = coord.plan_and_dispatch().await;
        settle().await;
        assert!(!a.on_directive(&plan.directives[0]).await.unwrap());
        assert_eq!(net.dial_count("A", "B"), 1);
    }

    #[tokio::test]
    async fn test_blacklisted_pair_never_links() {
        let net = MemoryNetwork::new();
        let (coord, _) = start_coordinator(&net, coordinator_settings(), None).await;
        let mut sa = settings("A", "X");
        sa.blacklist = BTreeSet::from(["B".to_string()]);
        let a = join(&net, sa).await;
        let b = join(&net, settings("B", "X")).await;
        eventually("presence", || coord.registry().len() == 2).await;

        let plan = coord.plan_and_dispatch().await;
        assert!(plan.directives.is_empty());
        settle().await;
        assert!(!a.is_linked("B"));
        assert!(!b.is_linked("A"));
    }

    #[tokio::test]
    async fn test_private_pairs_in_different_segments_stay_apart() {
        let net = MemoryNetwork::new();
        let (coord, _) = start_coordinator(&net, coordinator_settings(), None).await;
        let _a = join(&net, settings("A", "X")).await;
        let _b = join(&net, settings("B", "Y")).await;
        eventually("presence", || coord.registry().len() == 2).await;

        let plan = coord.plan_and_dispatch().await;
        assert!(plan.directives.is_empty());
        assert_eq!(plan.unreachable.len(), 1);
    }

    #[tokio::test]
    async fn test_directive_with_wrong_key_fails() {
        let net = MemoryNetwork::new();
        let (_coord, a, b) = linked_pair(&net).await;
        let c = join(&net, settings("C", "X")).await;

        let bad = huddle_core::ConnectionDirective {
            initiator: "A".into(),
            target_name: "C".into(),
            target_address: "lan-C".into(),
            target_port: c.listen_port(),
            target_access_key: "wrong".into(),
        };
        let err = a.on_directive(&bad).await.unwrap_err();
        assert!(matches!(err, HuddleError::AuthRejected { .. }));
        assert!(!a.is_linked("C"));
        assert!(b.is_linked("A"));
    }

    // ── Application payloads ───────────────────────────────────

    #[tokio::test]
    async fn test_send_reaches_peer_queue() {
        let net = MemoryNetwork::new();
        let (_coord, a, b) = linked_pair(&net).await;

        a.send("B", json!({"move": "e4"})).await.unwrap();
        b.send("A", json!({"move": "e5"})).await.unwrap();

        let got = timeout(b.recv()).await.unwrap().unwrap();
        assert_eq!(got.from, "A");
        assert_eq!(got.payload, json!({"move": "e4"}));
        let got = timeout(a.recv()).await.unwrap().unwrap();
        assert_eq!(got.from, "B");
        assert_eq!(got.payload, json!({"move": "e5"}));
    }

    #[tokio::test]
    async fn test_send_preserves_order_per_sender() {
        let net = MemoryNetwork::new();
        let (_coord, a, b) = linked_pair(&net).await;
        for n in 0..20 {
            a.send("B", json!(n)).await.unwrap();
        }
        for n in 0..20 {
            let got = timeout(b.recv()).await.unwrap().unwrap();
            assert_eq!(got.payload, json!(n));
        }
    }

    #[tokio::test]
    async fn test_send_to_unlinked_peer_fails() {
        let net = MemoryNetwork::new();
        let (_coord, a, _b) = linked_pair(&net).await;
        let err = a.send("nobody", json!(1)).await.unwrap_err();
        assert!(matches!(err, HuddleError::PeerUnreachable(_)));
    }

    #[tokio::test]
    async fn test_system_payloads_stay_out_of_app_queue() {
        let net = MemoryNetwork::new();
        let (_coord, a, b) = linked_pair(&net).await;
        a.write(StoreScope::Data, "k", json!(1)).await;
        settle().await;
        assert!(b.try_recv().is_none());
    }

    // ── Replication ────────────────────────────────────────────

    #[tokio::test]
    async fn test_writes_replicate_to_peer() {
        let net = MemoryNetwork::new();
        let (_coord, a, b) = linked_pair(&net).await;

        a.write(StoreScope::Data, "score", json!(10)).await;
        assert_eq!(a.read(StoreScope::Data, "score").unwrap(), json!(10));
        eventually("replica", || {
            b.peer_value("A", StoreScope::Data, "score") == Some(json!(10))
        })
        .await;

        assert!(a.delete(StoreScope::Data, "score").await);
        assert!(matches!(
            a.read(StoreScope::Data, "score"),
            Err(HuddleError::KeyNotFound(_))
        ));
        eventually("replica delete", || {
            b.peer_value("A", StoreScope::Data, "score").is_none()
        })
        .await;
    }

    #[tokio::test]
    async fn test_status_replicates_from_listener_side_too() {
        let net = MemoryNetwork::new();
        let (_coord, a, b) = linked_pair(&net).await;

        b.write(StoreScope::Status, "mood", json!("ready")).await;
        eventually("status replica", || {
            a.peer_value("B", StoreScope::Status, "mood") == Some(json!("ready"))
        })
        .await;
        assert!(a.peer_snapshot("B", StoreScope::Data).is_empty());
    }

    #[tokio::test]
    async fn test_late_joiner_receives_existing_entries() {
        let net = MemoryNetwork::new();
        let (coord, _) = start_coordinator(&net, coordinator_settings(), None).await;
        let a = join(&net, settings("A", "X")).await;
        a.write(StoreScope::Data, "board", json!([1, 2, 3])).await;

        let b = join(&net, settings("B", "X")).await;
        eventually("presence", || coord.registry().len() == 2).await;
        coord.plan_and_dispatch().await;

        eventually("initial flush", || {
            b.peer_value("A", StoreScope::Data, "board") == Some(json!([1, 2, 3]))
        })
        .await;
    }

    // ── Requests ───────────────────────────────────────────────

    #[tokio::test]
    async fn test_request_reaches_registered_handler() {
        let net = MemoryNetwork::new();
        let (_coord, a, b) = linked_pair(&net).await;
        b.register_handler("double", |from: &str, data: Value| {
            json!({"from": from, "n": data.as_i64().unwrap_or(0) * 2})
        });

        let got = a
            .request("B", "double", json!(21), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(got, json!({"from": "A", "n": 42}));

        // The dialer side can be asked too.
        a.register_handler("name", |_from: &str, _data: Value| json!("A"));
        let got = b
            .request("A", "name", Value::Null, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(got, json!("A"));
        assert!(a.try_recv().is_none());
        assert!(b.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_request_without_handler_is_reported() {
        let net = MemoryNetwork::new();
        let (_coord, a, b) = linked_pair(&net).await;
        b.register_handler("gone", |_from: &str, data: Value| data);
        assert!(b.unregister_handler("gone"));

        let err = a
            .request("B", "gone", json!(1), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, HuddleError::NoHandler { ref name, .. } if name == "gone"));
    }

    struct Stalled;

    #[async_trait::async_trait]
    impl RequestHandler for Stalled {
        async fn handle(&self, _from: &str, _data: Value) -> Value {
            std::future::pending::<()>().await;
            Value::Null
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_times_out() {
        let net = MemoryNetwork::new();
        let (_coord, a, b) = linked_pair(&net).await;
        b.register_handler("slow", Stalled);

        let err = a
            .request("B", "slow", Value::Null, Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, HuddleError::RequestTimeout { .. }));
    }

    #[tokio::test]
    async fn test_request_to_unlinked_peer_fails() {
        let net = MemoryNetwork::new();
        let a = join(&net, settings("A", "X")).await;
        let err = a
            .request("Z", "anything", Value::Null, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, HuddleError::PeerUnreachable(_)));
    }

    // ── Coordinator services ───────────────────────────────────

    #[tokio::test]
    async fn test_logs_reach_coordinator_sink() {
        let net = MemoryNetwork::new();
        let seen: Arc<Mutex<Vec<(String, LogRecord)>>> = Arc::default();
        let sink_seen = seen.clone();
        let sink: Arc<dyn LogSink> = Arc::new(move |from: &str, r: &LogRecord| {
            sink_seen.lock().push((from.to_string(), r.clone()));
        });
        let (coord, _) = start_coordinator(&net, coordinator_settings(), Some(sink)).await;
        let a = join(&net, settings("A", "X")).await;
        eventually("presence", || coord.registry().len() == 1).await;

        assert_eq!(
            a.log("W7", Severity::Warn, "disk low").await,
            SendOutcome::Sent
        );
        eventually("log", || !seen.lock().is_empty()).await;
        let (from, record) = seen.lock()[0].clone();
        assert_eq!(from, "A");
        assert_eq!(record.id, "W7");
        assert_eq!(record.severity, Severity::Warn);
        assert_eq!(record.message, "disk low");
    }

    #[tokio::test]
    async fn test_log_id_uses_catalog() {
        let net = MemoryNetwork::new();
        let seen: Arc<Mutex<Vec<LogRecord>>> = Arc::default();
        let sink_seen = seen.clone();
        let sink: Arc<dyn LogSink> = Arc::new(move |_from: &str, r: &LogRecord| {
            sink_seen.lock().push(r.clone());
        });
        let (coord, _) = start_coordinator(&net, coordinator_settings(), Some(sink)).await;
        let mut s = settings("A", "X");
        s.log_catalog.insert(
            "E100".into(),
            LogCatalogEntry {
                severity: Severity::Error,
                message: "disk full".into(),
            },
        );
        let a = join(&net, s).await;
        eventually("presence", || coord.registry().len() == 1).await;

        assert_eq!(a.log_id("E100").await, SendOutcome::Sent);
        assert_eq!(a.log_id("E999").await, SendOutcome::Sent);
        eventually("logs", || seen.lock().len() == 2).await;

        let records = seen.lock().clone();
        assert_eq!(records[0].id, "E100");
        assert_eq!(records[0].severity, Severity::Error);
        assert_eq!(records[0].message, "disk full");
        assert_eq!(records[1].id, "E999");
        assert_eq!(records[1].severity, Severity::Error);
        assert_eq!(records[1].message, "unknown log id");
    }

    #[tokio::test]
    async fn test_log_before_coordinator_link_is_buffered() {
        let net = MemoryNetwork::new();
        let a = join(&net, settings("A", "X")).await;
        assert_eq!(
            a.log("I1", Severity::Info, "early").await,
            SendOutcome::Buffered
        );
        assert_eq!(a.relay().buffered(), 1);
    }

    #[tokio::test]
    async fn test_credential_table_is_distributed_and_enforced() {
        let net = MemoryNetwork::new();
        let mut table = CredentialTable::new();
        table.insert("A".into(), hash_credential("pw-a"));
        table.insert("B".into(), hash_credential("pw-b"));
        let mut cs = coordinator_settings();
        cs.credentials = table.clone();
        let (coord, _) = start_coordinator(&net, cs, None).await;

        let mut members = Vec::new();
        for (name, pw) in [("A", "pw-a"), ("B", "pw-b")] {
            let p = Participant::start(
                settings(name, "X"),
                net.transport_with_credential(name, Some(pw.into())).into(),
                net.transport_with_credential(name, Some(pw.into())).into(),
            )
            .await
            .unwrap();
            members.push(p);
        }
        let (a, b) = (&members[0], &members[1]);
        eventually("tables", || {
            a.credential_table() == table && b.credential_table() == table
        })
        .await;

        // No credential: the coordinator refuses the link.
        let _stranger = join(&net, settings("S", "X")).await;
        settle().await;
        assert!(coord.registry().get("S").is_none());

        coord.plan_and_dispatch().await;
        eventually("authenticated link", || a.is_linked("B")).await;
    }

    #[tokio::test]
    async fn test_allowed_members_gate_client_pairs() {
        let net = MemoryNetwork::new();
        let mut cs = coordinator_settings();
        cs.allowed_members = BTreeSet::from(["S".to_string()]);
        let (coord, _) = start_coordinator(&net, cs, None).await;
        let c1 = join(&net, settings("C1", "X")).await;
        let c2 = join(&net, settings("C2", "X")).await;
        let s = join(&net, settings("S", "X")).await;
        eventually("presence", || coord.registry().len() == 3).await;

        coord.plan_and_dispatch().await;
        eventually("server links", || s.peers().len() == 2).await;
        assert!(!c1.is_linked("C2"));
        assert!(!c2.is_linked("C1"));
    }
}
