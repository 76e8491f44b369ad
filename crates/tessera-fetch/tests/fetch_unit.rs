//! Fetch unit behavior tests
//!
//! Exercises the submission surface and the worker against the scripted
//! in-memory federation client: origin rotation across failing peers,
//! candidate exhaustion, duplicate-submission coalescing, back-pressure,
//! signature-mismatch rotation, and the runlevel guard.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tessera_core::{
    signing, Error, EventId, KeyId, Pdu, PduBody, RoomId, Runlevel, RunlevelHandle, ServerName,
    SigningKey, UserId,
};
use tessera_federation::{
    FederationError, FederationRequest, MemoryFederationClient, ServerPool,
};
use tessera_fetch::{FetchOpts, Fetcher, StaticRoomOrigins};
use tessera_keys::KeyCache;

const LOCAL: &str = "local.example";
const AUTHOR: &str = "origin.example";

struct Fixture {
    fetcher: Arc<Fetcher>,
    client: Arc<MemoryFederationClient>,
    origins: Arc<StaticRoomOrigins>,
    pool: Arc<ServerPool>,
    keys: Arc<KeyCache>,
    runlevel: RunlevelHandle,
}

fn fixture(opts: FetchOpts) -> Fixture {
    let client = Arc::new(MemoryFederationClient::new());
    let origins = Arc::new(StaticRoomOrigins::new());
    let pool = Arc::new(ServerPool::new());
    let keys = Arc::new(KeyCache::new(client.clone()));
    let runlevel = RunlevelHandle::running();

    let fetcher = Fetcher::spawn(
        opts,
        client.clone(),
        origins.clone(),
        keys.clone(),
        pool.clone(),
        ServerName::from(LOCAL),
        runlevel.clone(),
    );

    Fixture {
        fetcher,
        client,
        origins,
        pool,
        keys,
        runlevel,
    }
}

fn room() -> RoomId {
    RoomId::from("!room:origin.example")
}

fn author_key() -> SigningKey {
    SigningKey::from_bytes([42u8; 32])
}

/// A correctly hashed and signed event authored by `origin.example`.
fn signed_event() -> Pdu {
    let mut body = PduBody {
        room_id: room(),
        sender: UserId::from(format!("@alice:{AUTHOR}")),
        kind: "m.room.message".into(),
        origin: Some(ServerName::from(AUTHOR)),
        origin_server_ts: 1_700_000_000_000,
        depth: Some(9),
        prev_events: vec![EventId::from("$prev")],
        auth_events: vec![EventId::from("$auth")],
        content: serde_json::json!({"body": "over federation"}),
        ..PduBody::default()
    };
    signing::hash_event(&mut body).unwrap();
    signing::sign_event(
        &mut body,
        &ServerName::from(AUTHOR),
        &KeyId::from("ed25519:auto"),
        &author_key(),
    )
    .unwrap();
    Pdu::from_body(body).unwrap()
}

fn event_request(event_id: &EventId) -> FederationRequest {
    FederationRequest::Event {
        event_id: event_id.clone(),
    }
}

fn unreachable(origin: &str) -> FederationError {
    FederationError::Unreachable {
        origin: origin.into(),
        reason: "connection refused".into(),
    }
}

#[tokio::test]
async fn rotation_lands_on_the_healthy_peer() {
    let fx = fixture(FetchOpts::for_testing());
    let event = signed_event();
    let request = event_request(&event.event_id);

    let s1 = ServerName::from("s1.example");
    let s2 = ServerName::from("s2.example");
    let s3 = ServerName::from("s3.example");
    fx.origins
        .put(room(), vec![s1.clone(), s2.clone(), s3.clone()]);

    fx.client.fail(&s1, &request, unreachable("s1.example"));
    fx.client.fail(&s2, &request, unreachable("s2.example"));
    fx.client
        .respond(&s3, &request, event.serialized().unwrap().into_bytes());

    let ticket = fx.fetcher.start(&room(), &event.event_id).await.unwrap();
    let result = ticket.wait().await.unwrap();

    assert_eq!(result.origin, s3);
    assert_eq!(result.pdu.event_id, event.event_id);

    // The attempted-set discipline means each origin is called at most
    // once, and exactly one call succeeded.
    let calls = fx.client.calls();
    let distinct: BTreeSet<_> = calls.iter().map(|(origin, _)| origin.clone()).collect();
    assert_eq!(calls.len(), distinct.len());
    assert_eq!(fx.client.calls_to(&s3), 1);
    assert_eq!(calls.last().map(|(origin, _)| origin.clone()), Some(s3));
}

#[tokio::test]
async fn candidate_exhaustion_reports_not_found() {
    let fx = fixture(FetchOpts::for_testing());
    let event = signed_event();
    let request = event_request(&event.event_id);

    let peers = ["s1.example", "s2.example", "s3.example"];
    fx.origins
        .put(room(), peers.iter().map(|p| ServerName::from(*p)).collect());
    for peer in peers {
        fx.client
            .fail(&ServerName::from(peer), &request, unreachable(peer));
    }

    let ticket = fx.fetcher.start(&room(), &event.event_id).await.unwrap();
    let result = ticket.wait().await;
    assert!(matches!(result, Err(Error::NotFound { .. })));

    // All three peers were tried exactly once.
    assert_eq!(fx.client.call_count(), 3);
    assert!(!fx.fetcher.exists(&event.event_id).await);
    assert_eq!(fx.fetcher.count(), 0);
}

#[tokio::test]
async fn duplicate_submission_coalesces() {
    let fx = fixture(FetchOpts::for_testing());
    let event = signed_event();
    let request = event_request(&event.event_id);

    let s1 = ServerName::from("s1.example");
    fx.origins.put(room(), vec![s1.clone()]);
    fx.client.hang(&s1, &request);

    let first = fx.fetcher.start(&room(), &event.event_id).await.unwrap();
    let second = fx.fetcher.start(&room(), &event.event_id).await.unwrap();

    assert_eq!(fx.fetcher.count(), 1);
    let info = fx.fetcher.info(&event.event_id).await.unwrap();
    assert_eq!(info.listeners, 2);
    assert_eq!(fx.client.call_count(), 1);

    // The single request eventually exhausts (the only origin hangs past
    // its budget) and both listeners observe the same terminal error.
    let (a, b) = tokio::join!(first.wait(), second.wait());
    assert!(matches!(a, Err(Error::NotFound { .. })));
    assert!(matches!(b, Err(Error::NotFound { .. })));
    assert_eq!(fx.client.call_count(), 1);
}

#[tokio::test]
async fn back_pressure_parks_the_third_submitter() {
    let opts = FetchOpts {
        requests_max: 2,
        timeout: Duration::from_millis(300),
        ..FetchOpts::for_testing()
    };
    let fx = fixture(opts);

    // Three rooms, each with one hanging origin, so three requests that
    // cannot complete quickly.
    let mut events = Vec::new();
    for (i, host) in ["h1.example", "h2.example", "h3.example"].iter().enumerate() {
        let origin = ServerName::from(*host);
        let room = RoomId::from(format!("!room{i}:{host}"));
        let mut body = signed_event().body;
        body.room_id = room.clone();
        let event = Pdu::from_body(body).unwrap();
        fx.origins.put(room.clone(), vec![origin.clone()]);
        fx.client.hang(&origin, &event_request(&event.event_id));
        events.push((room, event));
    }

    let _t1 = fx
        .fetcher
        .start(&events[0].0, &events[0].1.event_id)
        .await
        .unwrap();
    let _t2 = fx
        .fetcher
        .start(&events[1].0, &events[1].1.event_id)
        .await
        .unwrap();
    assert_eq!(fx.fetcher.count(), 2);

    let third = {
        let fetcher = fx.fetcher.clone();
        let (room, event) = events[2].clone();
        tokio::spawn(async move { fetcher.start(&room, &event.event_id).await })
    };

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!third.is_finished(), "third submission should be parked");

    // The hanging attempts exceed their budget, exhaust their single
    // origin, and free slots; the parked submitter then proceeds.
    let ticket = tokio::time::timeout(Duration::from_secs(5), third)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    drop(ticket);
    fx.fetcher.shutdown().await;
}

#[tokio::test]
async fn signature_mismatch_rotates_to_next_peer() {
    let fx = fixture(FetchOpts::for_testing());
    let event = signed_event();
    let request = event_request(&event.event_id);

    // Cache the author's real key so the fetch-layer signature check runs.
    let author = ServerName::from(AUTHOR);
    let key_id = KeyId::from("ed25519:auto");
    fx.keys.insert(
        author.clone(),
        key_id.clone(),
        author_key().verifying_key(),
        tessera_core::unix_now_ms() + 600_000,
    );

    // s1 serves a copy signed by the wrong key; s2 serves the real one.
    let mut forged = event.body.clone();
    forged.signatures.clear();
    signing::sign_event(
        &mut forged,
        &author,
        &key_id,
        &SigningKey::from_bytes([13u8; 32]),
    )
    .unwrap();
    let forged = Pdu::from_parts(event.event_id.clone(), forged);

    let s1 = ServerName::from("s1.example");
    let s2 = ServerName::from("s2.example");
    fx.origins.put(room(), vec![s1.clone(), s2.clone()]);
    fx.client
        .respond(&s1, &request, forged.serialized().unwrap().into_bytes());
    fx.client
        .respond(&s2, &request, event.serialized().unwrap().into_bytes());

    let ticket = fx.fetcher.start(&room(), &event.event_id).await.unwrap();
    let result = ticket.wait().await.unwrap();

    assert_eq!(result.origin, s2);
    assert_eq!(fx.client.calls_to(&s1), 1);
    assert_eq!(fx.client.calls_to(&s2), 1);
}

#[tokio::test]
async fn runlevel_guard_refuses_at_quit() {
    let fx = fixture(FetchOpts::for_testing());
    fx.runlevel.set(Runlevel::Quit);

    let event = signed_event();
    let result = fx.fetcher.start(&room(), &event.event_id).await;
    assert!(matches!(result, Err(Error::Unavailable { .. })));
}

#[tokio::test]
async fn disabled_unit_refuses() {
    let opts = FetchOpts {
        enable: false,
        ..FetchOpts::for_testing()
    };
    let fx = fixture(opts);

    let event = signed_event();
    let result = fx.fetcher.start(&room(), &event.event_id).await;
    assert!(matches!(result, Err(Error::Unavailable { .. })));
}

#[tokio::test]
async fn inflight_request_reports_timestamps() {
    let fx = fixture(FetchOpts {
        timeout: Duration::from_secs(30),
        ..FetchOpts::for_testing()
    });
    let event = signed_event();
    let request = event_request(&event.event_id);

    let s1 = ServerName::from("s1.example");
    fx.origins.put(room(), vec![s1.clone()]);
    fx.client.hang(&s1, &request);

    let _ticket = fx.fetcher.start(&room(), &event.event_id).await.unwrap();

    let info = fx.fetcher.info(&event.event_id).await.unwrap();
    assert!(info.started > 0);
    assert!(info.last >= info.started);
    assert_eq!(info.finished, 0);
    assert_eq!(info.origin, Some(s1.clone()));
    assert_eq!(info.attempted, BTreeSet::from([s1]));

    fx.fetcher.shutdown().await;
}

#[tokio::test]
async fn error_latched_peer_is_skipped() {
    let fx = fixture(FetchOpts::for_testing());
    let event = signed_event();
    let request = event_request(&event.event_id);

    let s1 = ServerName::from("s1.example");
    let s2 = ServerName::from("s2.example");
    fx.origins.put(room(), vec![s1.clone(), s2.clone()]);
    fx.pool.errset(&s1, "previous failure");
    fx.client
        .respond(&s2, &request, event.serialized().unwrap().into_bytes());

    let ticket = fx.fetcher.start(&room(), &event.event_id).await.unwrap();
    let result = ticket.wait().await.unwrap();

    assert_eq!(result.origin, s2);
    assert_eq!(fx.client.calls_to(&s1), 0);
}
