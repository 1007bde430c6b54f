use std::sync::Arc;

use audit_log::{AuditEntry, AuditEventType, AuditSink, AuditSource};

use crate::connection::{Connection, ConnectionTable, Role};
use crate::envelope::{EnvelopeError, Inbound, Registration, Reply};
use crate::error::RouteError;
use crate::registry::Registry;

/// What the connection task should do after a message was handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    /// Stop reading and close the connection gracefully.
    Close,
}

/// Outcome of routing one `proxy_res`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResponseRouting {
    /// Consumers that were waiting on the request id. Each had it removed.
    pub matched: usize,
    /// Of those, how many had the response queued.
    pub delivered: usize,
}

/// Message dispatcher shared by every connection task.
///
/// Each connection moves `Unregistered -> Provider` or
/// `Unregistered -> Consumer` exactly once and stays there until it closes.
/// `proxy_req` travels consumer -> provider; `proxy_res` travels back to
/// whichever consumer bound to that provider is waiting on the `reqId`.
///
/// Response routing scans the connection table rather than keeping a
/// secondary index. If two consumers of the same provider pick the same
/// `reqId`, both receive the response.
pub struct Router {
    registry: Arc<Registry>,
    connections: Arc<ConnectionTable>,
    audit: Option<AuditSink>,
}

impl Router {
    pub fn new(registry: Arc<Registry>, connections: Arc<ConnectionTable>) -> Self {
        Self {
            registry,
            connections,
            audit: None,
        }
    }

    pub fn with_audit(mut self, audit: AuditSink) -> Self {
        self.audit = Some(audit);
        self
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn connections(&self) -> &Arc<ConnectionTable> {
        &self.connections
    }

    /// Make a freshly accepted connection visible to response routing and
    /// the liveness monitor.
    pub fn connect(&self, conn: &Arc<Connection>) {
        self.connections.insert(Arc::clone(conn));
    }

    /// Forget a closed connection. A provider's registry entry is removed
    /// only if it still points at this connection.
    pub fn disconnect(&self, conn: &Connection) {
        self.connections.remove(&conn.id());

        if let Some(identity) = conn.provider_identity() {
            if self.registry.remove(&identity, conn.id()) {
                tracing::info!(connection_id = %conn.id(), %identity, "provider disconnected");
            } else {
                tracing::debug!(
                    connection_id = %conn.id(),
                    %identity,
                    "superseded provider disconnected"
                );
            }
        }
    }

    /// Handle one inbound text message from `conn`.
    pub fn handle(&self, conn: &Arc<Connection>, text: &str) -> Flow {
        match self.dispatch(conn, text) {
            Ok(()) => Flow::Continue,
            Err(err) => self.reject(conn, err),
        }
    }

    /// Handle a binary frame. JSON carried in binary frames is routed like
    /// text; anything that is not UTF-8 is malformed.
    pub fn handle_binary(&self, conn: &Arc<Connection>, bytes: &[u8]) -> Flow {
        match std::str::from_utf8(bytes) {
            Ok(text) => self.handle(conn, text),
            Err(_) => self.reject(conn, EnvelopeError::Malformed.into()),
        }
    }

    fn reject(&self, conn: &Connection, err: RouteError) -> Flow {
        tracing::debug!(connection_id = %conn.id(), %err, "message rejected");

        if let Err(send_err) = conn.reply(err.reply()) {
            tracing::debug!(connection_id = %conn.id(), %send_err, "failed to send error reply");
        }

        if err.closes_connection() {
            Flow::Close
        } else {
            Flow::Continue
        }
    }

    fn dispatch(&self, conn: &Arc<Connection>, text: &str) -> Result<(), RouteError> {
        match Inbound::parse(text)? {
            Inbound::Register(Registration::Provider { id, token }) => {
                self.register_provider(conn, &id, &token)
            }
            Inbound::Register(Registration::Consumer { target, token }) => {
                self.register_consumer(conn, &target, &token)
            }
            Inbound::ProxyRequest { req_id } => self.forward_request(conn, &req_id, text),
            Inbound::ProxyResponse { req_id } => {
                if conn.role() != Role::Provider {
                    tracing::debug!(connection_id = %conn.id(), "dropping proxy_res from non-provider");
                    return Ok(());
                }
                let req_id = req_id.ok_or(EnvelopeError::MissingRequestId { kind: "proxy_res" })?;
                self.route_response(conn, &req_id, text);
                Ok(())
            }
            Inbound::Unknown { kind } => Err(RouteError::UnknownType { kind }),
        }
    }

    // ------------------------------------------------------------------
    // register
    // ------------------------------------------------------------------

    fn register_provider(
        &self,
        conn: &Arc<Connection>,
        identity: &str,
        secret: &str,
    ) -> Result<(), RouteError> {
        conn.become_provider(identity)?;

        if let Some(superseded) = self.registry.register(identity, secret, Arc::clone(conn)) {
            tracing::warn!(
                connection_id = %conn.id(),
                superseded_connection_id = %superseded.id(),
                %identity,
                "provider identity re-registered; previous connection superseded"
            );
            self.audit(
                AuditEventType::ProviderSuperseded,
                conn,
                serde_json::json!({
                    "identity": identity,
                    "superseded_connection_id": superseded.id().to_string(),
                }),
            );
        }

        tracing::info!(
            connection_id = %conn.id(),
            remote_addr = %conn.remote_addr(),
            %identity,
            "provider registered"
        );
        self.audit(
            AuditEventType::ProviderRegistered,
            conn,
            serde_json::json!({ "identity": identity }),
        );
        self.acknowledge(conn, Reply::ProviderRegistered);
        Ok(())
    }

    fn register_consumer(
        &self,
        conn: &Arc<Connection>,
        target: &str,
        secret: &str,
    ) -> Result<(), RouteError> {
        let role = conn.role();
        if role != Role::Unregistered {
            return Err(crate::connection::AlreadyRegistered(role).into());
        }

        if self.registry.authorize(target, secret).is_none() {
            tracing::warn!(
                connection_id = %conn.id(),
                remote_addr = %conn.remote_addr(),
                %target,
                "consumer authentication failed"
            );
            self.audit(
                AuditEventType::AuthenticationFailed,
                conn,
                serde_json::json!({ "target": target }),
            );
            return Err(RouteError::AuthenticationFailed {
                target: target.to_string(),
            });
        }

        conn.become_consumer(target, secret)?;

        tracing::info!(
            connection_id = %conn.id(),
            remote_addr = %conn.remote_addr(),
            %target,
            "consumer registered"
        );
        self.audit(
            AuditEventType::ConsumerRegistered,
            conn,
            serde_json::json!({ "target": target }),
        );
        self.acknowledge(conn, Reply::ConsumerRegistered);
        Ok(())
    }

    fn acknowledge(&self, conn: &Connection, reply: Reply) {
        if let Err(err) = conn.reply(reply) {
            tracing::debug!(connection_id = %conn.id(), %err, "failed to send acknowledgment");
        }
    }

    // ------------------------------------------------------------------
    // proxy_req / proxy_res
    // ------------------------------------------------------------------

    fn forward_request(
        &self,
        conn: &Connection,
        req_id: &str,
        raw: &str,
    ) -> Result<(), RouteError> {
        let (target, secret) = conn.consumer_binding().ok_or(RouteError::NotRegistered)?;

        // The provider may have reconnected with a new token or vanished
        // since this consumer registered.
        let provider = self
            .registry
            .authorize(&target, &secret)
            .ok_or_else(|| RouteError::TargetUnavailable {
                target: target.clone(),
            })?;

        // Recorded before the write so a fast response always finds it. It
        // stays recorded even if the write fails.
        conn.track_request(req_id);

        provider
            .send_text(raw)
            .map_err(|source| RouteError::ForwardFailed {
                target: target.clone(),
                source,
            })?;

        tracing::debug!(
            connection_id = %conn.id(),
            provider_connection_id = %provider.id(),
            %target,
            req_id,
            "request forwarded"
        );
        Ok(())
    }

    /// Deliver a provider's response to every consumer waiting on `req_id`.
    /// Responses from non-providers are dropped without a reply.
    pub fn route_response(&self, conn: &Connection, req_id: &str, raw: &str) -> ResponseRouting {
        let Some(identity) = conn.provider_identity() else {
            tracing::debug!(
                connection_id = %conn.id(),
                req_id,
                "dropping proxy_res from non-provider"
            );
            return ResponseRouting::default();
        };

        let mut routing = ResponseRouting::default();
        for consumer in self.connections.iter() {
            if !consumer.resolve_request(&identity, req_id) {
                continue;
            }
            routing.matched += 1;
            match consumer.send_text(raw) {
                Ok(()) => routing.delivered += 1,
                Err(err) => tracing::debug!(
                    connection_id = %consumer.id(),
                    req_id,
                    %err,
                    "failed to deliver response"
                ),
            }
        }

        match routing.matched {
            0 => tracing::debug!(%identity, req_id, "no consumer waiting for response"),
            1 if routing.delivered == 0 => {
                tracing::debug!(%identity, req_id, "waiting consumer unreachable; response dropped")
            }
            1 => tracing::debug!(%identity, req_id, "response delivered"),
            n => tracing::warn!(
                %identity,
                req_id,
                recipients = n,
                delivered = routing.delivered,
                "request id collision across consumers; response fanned out"
            ),
        }
        routing
    }

    fn audit(&self, event_type: AuditEventType, conn: &Connection, details: serde_json::Value) {
        if let Some(audit) = &self.audit {
            let source = AuditSource::new("router").with_connection(conn.id(), conn.remote_addr());
            audit.try_log(AuditEntry::new(event_type, source, details));
        }
    }
}

#[cfg(test)]
mod tests {
    use tokio::sync::mpsc;

    use super::*;
    use crate::connection::Outbound;

    struct Peer {
        conn: Arc<Connection>,
        rx: mpsc::Receiver<Outbound>,
    }

    impl Peer {
        fn connect(router: &Router) -> Self {
            let (conn, rx) = Connection::new("127.0.0.1:40002".parse().unwrap(), 16);
            router.connect(&conn);
            Self { conn, rx }
        }

        fn send(&self, router: &Router, text: &str) -> Flow {
            router.handle(&self.conn, text)
        }

        fn next_text(&mut self) -> Option<String> {
            match self.rx.try_recv() {
                Ok(Outbound::Text(text)) => Some(text),
                Ok(other) => panic!("unexpected frame {other:?}"),
                Err(_) => None,
            }
        }

        fn next_json(&mut self) -> serde_json::Value {
            let text = self.next_text().expect("expected a queued message");
            serde_json::from_str(&text).unwrap()
        }
    }

    fn router() -> Router {
        Router::new(Arc::new(Registry::new()), Arc::new(ConnectionTable::new()))
    }

    fn register_provider(router: &Router, id: &str, token: &str) -> Peer {
        let mut peer = Peer::connect(router);
        let msg = format!(r#"{{"type":"register","role":"provider","id":"{id}","token":"{token}"}}"#);
        assert_eq!(peer.send(router, &msg), Flow::Continue);
        assert_eq!(peer.next_json()["ok"], true);
        peer
    }

    fn register_consumer(router: &Router, target: &str, token: &str) -> (Peer, Flow) {
        let peer = Peer::connect(router);
        let msg =
            format!(r#"{{"type":"register","role":"consumer","target":"{target}","token":"{token}"}}"#);
        let flow = peer.send(router, &msg);
        (peer, flow)
    }

    fn proxy_req(req_id: &str) -> String {
        format!(
            r#"{{"type":"proxy_req","reqId":"{req_id}","method":"GET","url":"https://example.com","headers":{{"x-a":"1"}},"body":""}}"#
        )
    }

    fn proxy_res(req_id: &str) -> String {
        format!(r#"{{"type":"proxy_res","reqId":"{req_id}","status":200,"headers":{{}},"body":"aGk="}}"#)
    }

    #[test]
    fn consumer_with_matching_secret_registers() {
        let router = router();
        let _provider = register_provider(&router, "P1", "T");
        let (mut consumer, flow) = register_consumer(&router, "P1", "T");

        assert_eq!(flow, Flow::Continue);
        assert_eq!(
            consumer.next_json(),
            serde_json::json!({ "ok": true, "msg": "consumer registered" })
        );
        assert_eq!(consumer.conn.role(), Role::Consumer);
    }

    #[test]
    fn bad_secret_or_unknown_target_closes_consumer() {
        let router = router();
        let _provider = register_provider(&router, "P1", "T");

        for (target, token) in [("P1", "wrong"), ("P9", "T")] {
            let (mut consumer, flow) = register_consumer(&router, target, token);
            assert_eq!(flow, Flow::Close);
            assert_eq!(
                consumer.next_json(),
                serde_json::json!({ "ok": false, "error": "target_not_found_or_bad_token" })
            );
            assert_eq!(consumer.conn.role(), Role::Unregistered);
        }
    }

    #[test]
    fn invalid_registration_keeps_connection_open_and_unregistered() {
        let router = router();
        let mut peer = Peer::connect(&router);
        let flow = peer.send(&router, r#"{"type":"register","role":"provider","id":"P1"}"#);

        assert_eq!(flow, Flow::Continue);
        assert_eq!(
            peer.next_json(),
            serde_json::json!({ "ok": false, "error": "invalid_register" })
        );
        assert_eq!(peer.conn.role(), Role::Unregistered);
    }

    #[test]
    fn malformed_message_gets_parse_error_without_closing() {
        let router = router();
        let mut peer = Peer::connect(&router);
        assert_eq!(peer.send(&router, "{nope"), Flow::Continue);
        assert_eq!(peer.next_json(), serde_json::json!({ "error": "bad-json" }));

        assert_eq!(router.handle_binary(&peer.conn, &[0xff, 0xfe]), Flow::Continue);
        assert_eq!(peer.next_json(), serde_json::json!({ "error": "bad-json" }));
    }

    #[test]
    fn registered_connection_cannot_register_again() {
        let router = router();
        let mut provider = register_provider(&router, "P1", "T");
        let flow = provider.send(
            &router,
            r#"{"type":"register","role":"consumer","target":"P1","token":"T"}"#,
        );

        assert_eq!(flow, Flow::Continue);
        assert_eq!(provider.next_json()["error"], "already_registered");
        assert_eq!(provider.conn.role(), Role::Provider);
    }

    #[test]
    fn request_before_registration_is_rejected_and_not_forwarded() {
        let router = router();
        let mut provider = register_provider(&router, "P1", "T");
        let mut stranger = Peer::connect(&router);

        stranger.send(&router, &proxy_req("r1"));
        assert_eq!(
            stranger.next_json(),
            serde_json::json!({ "error": "not_registered_as_client" })
        );
        assert!(provider.next_text().is_none());
    }

    #[test]
    fn request_and_response_reach_only_the_issuing_consumer() {
        let router = router();
        let mut provider = register_provider(&router, "P1", "T");
        let (mut a, _) = register_consumer(&router, "P1", "T");
        let (mut b, _) = register_consumer(&router, "P1", "T");
        a.next_text();
        b.next_text();

        let req = proxy_req("r1");
        a.send(&router, &req);
        assert_eq!(provider.next_text().as_deref(), Some(req.as_str()));
        assert_eq!(a.conn.pending_requests(), 1);

        let res = proxy_res("r1");
        assert_eq!(provider.send(&router, &res), Flow::Continue);
        assert_eq!(a.next_text().as_deref(), Some(res.as_str()));
        assert!(b.next_text().is_none());
        assert_eq!(a.conn.pending_requests(), 0);
    }

    #[test]
    fn duplicate_response_is_not_delivered_twice() {
        let router = router();
        let mut provider = register_provider(&router, "P1", "T");
        let (mut a, _) = register_consumer(&router, "P1", "T");
        a.next_text();

        a.send(&router, &proxy_req("r1"));
        provider.next_text();

        let res = proxy_res("r1");
        assert_eq!(router.route_response(&provider.conn, "r1", &res).delivered, 1);
        assert_eq!(
            router.route_response(&provider.conn, "r1", &res),
            ResponseRouting::default()
        );
        assert!(a.next_text().is_some());
        assert!(a.next_text().is_none());
    }

    #[test]
    fn responses_from_non_providers_are_silently_dropped() {
        let router = router();
        let mut provider = register_provider(&router, "P1", "T");
        let (mut a, _) = register_consumer(&router, "P1", "T");
        a.next_text();
        a.send(&router, &proxy_req("r1"));
        provider.next_text();

        // A consumer answering its own request: no reply, no delivery.
        assert_eq!(a.send(&router, &proxy_res("r1")), Flow::Continue);
        assert!(a.next_text().is_none());
        assert_eq!(a.conn.pending_requests(), 1);
    }

    #[test]
    fn response_without_request_id_from_non_provider_is_dropped() {
        let router = router();
        let _provider = register_provider(&router, "P1", "T");
        let (mut a, _) = register_consumer(&router, "P1", "T");
        a.next_text();
        let mut stranger = Peer::connect(&router);

        for peer in [&mut a, &mut stranger] {
            assert_eq!(peer.send(&router, r#"{"type":"proxy_res","status":200}"#), Flow::Continue);
            assert!(peer.next_text().is_none());
        }
    }

    #[test]
    fn response_without_request_id_from_provider_is_malformed() {
        let router = router();
        let mut provider = register_provider(&router, "P1", "T");

        assert_eq!(
            provider.send(&router, r#"{"type":"proxy_res","status":200}"#),
            Flow::Continue
        );
        assert_eq!(provider.next_json(), serde_json::json!({ "error": "bad-json" }));
    }

    #[test]
    fn failed_delivery_is_swallowed_and_request_cleared() {
        let router = router();
        let mut provider = register_provider(&router, "P1", "T");
        let (a, _) = register_consumer(&router, "P1", "T");
        let Peer { conn: consumer, rx } = a;
        drop(rx);

        router.handle(&consumer, &proxy_req("r1"));
        provider.next_text();
        assert_eq!(consumer.pending_requests(), 1);

        assert_eq!(provider.send(&router, &proxy_res("r1")), Flow::Continue);
        assert!(provider.next_text().is_none());
        assert_eq!(consumer.pending_requests(), 0);
    }

    #[test]
    fn unreachable_consumer_counts_as_matched_but_not_delivered() {
        let router = router();
        let mut provider = register_provider(&router, "P1", "T");
        let (mut a, _) = register_consumer(&router, "P1", "T");
        a.next_text();
        a.send(&router, &proxy_req("r1"));
        provider.next_text();
        let Peer { conn: consumer, rx } = a;
        drop(rx);

        assert_eq!(
            router.route_response(&provider.conn, "r1", &proxy_res("r1")),
            ResponseRouting {
                matched: 1,
                delivered: 0,
            }
        );
        assert_eq!(consumer.pending_requests(), 0);
    }

    #[test]
    fn responses_do_not_cross_providers() {
        let router = router();
        let mut p1 = register_provider(&router, "P1", "T");
        let p2 = register_provider(&router, "P2", "T");
        let (mut a, _) = register_consumer(&router, "P1", "T");
        a.next_text();
        a.send(&router, &proxy_req("r1"));
        p1.next_text();

        assert_eq!(
            router.route_response(&p2.conn, "r1", &proxy_res("r1")),
            ResponseRouting::default()
        );
        assert_eq!(a.conn.pending_requests(), 1);
    }

    #[test]
    fn colliding_request_ids_fan_out() {
        let router = router();
        let mut provider = register_provider(&router, "P1", "T");
        let (mut a, _) = register_consumer(&router, "P1", "T");
        let (mut b, _) = register_consumer(&router, "P1", "T");
        a.next_text();
        b.next_text();

        a.send(&router, &proxy_req("same"));
        b.send(&router, &proxy_req("same"));
        provider.next_text();
        provider.next_text();

        assert_eq!(
            router.route_response(&provider.conn, "same", &proxy_res("same")),
            ResponseRouting {
                matched: 2,
                delivered: 2,
            }
        );
    }

    #[test]
    fn provider_disconnect_makes_target_unavailable() {
        let router = router();
        let provider = register_provider(&router, "P1", "T");
        let (mut a, _) = register_consumer(&router, "P1", "T");
        a.next_text();

        router.disconnect(&provider.conn);
        assert!(router.registry().lookup("P1").is_none());

        a.send(&router, &proxy_req("r1"));
        assert_eq!(
            a.next_json(),
            serde_json::json!({ "error": "target_not_available" })
        );
    }

    #[test]
    fn provider_reconnect_with_new_token_invalidates_old_bindings() {
        let router = router();
        let _old = register_provider(&router, "P1", "T");
        let (mut a, _) = register_consumer(&router, "P1", "T");
        a.next_text();

        let mut new = register_provider(&router, "P1", "T2");
        a.send(&router, &proxy_req("r1"));
        assert_eq!(a.next_json()["error"], "target_not_available");
        assert!(new.next_text().is_none());
    }

    #[test]
    fn superseded_provider_closing_keeps_new_entry() {
        let router = router();
        let old = register_provider(&router, "P1", "T");
        let new = register_provider(&router, "P1", "T");

        router.disconnect(&old.conn);
        let entry = router.registry().lookup("P1").unwrap();
        assert_eq!(entry.connection.id(), new.conn.id());
        assert_eq!(router.connections().len(), 1);
    }

    #[test]
    fn failed_forward_reports_error_but_keeps_request_pending() {
        let router = router();
        let Peer { conn: provider, rx } = register_provider(&router, "P1", "T");
        drop(rx);
        let (mut a, _) = register_consumer(&router, "P1", "T");
        a.next_text();

        a.send(&router, &proxy_req("r1"));
        assert_eq!(a.next_json(), serde_json::json!({ "error": "failed_forward" }));
        assert_eq!(a.conn.pending_requests(), 1);
        assert_eq!(provider.role(), Role::Provider);
    }

    #[test]
    fn unknown_type_is_reported() {
        let router = router();
        let mut peer = Peer::connect(&router);
        assert_eq!(peer.send(&router, r#"{"type":"hello"}"#), Flow::Continue);
        assert_eq!(
            peer.next_json(),
            serde_json::json!({ "ok": false, "error": "unknown_type" })
        );
    }
}
