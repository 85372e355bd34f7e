//! Runs that break: departures, tampered shuffles and unusable schedules

mod common;

use std::sync::Arc;
use std::time::Duration;

use ::common::client::Client;
use ::common::config::DcNetType;
use ::common::crypto::{RistrettoPoint, SecretKey, Signature, Suite};
use ::common::net::{authenticate_peer, read_message, write_message, Message, Parameters, MAX_FRAME_SIZE};
use ::common::roster::{Roster, RosterEntry};
use ::common::schedule::{
    HonestProver, ScheduleError, ShuffleProver, ShuffleStep, ShuffleTranscript, SCHEDULE_CONTEXT,
};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;

use common::{test_config, wait_until, within, Cluster, FIRST_CLIENT_ID};

/// Shuffles honestly, then swaps the first output key for another point.
struct TamperingProver;

impl ShuffleProver for TamperingProver {
    fn prove(&self, base: &RistrettoPoint, keys: &[RistrettoPoint]) -> Result<ShuffleStep, ScheduleError> {
        let mut step = HonestProver.prove(base, keys)?;
        step.keys[0] += Suite.generator();
        Ok(step)
    }
}

#[tokio::test]
async fn test_trustee_departure_restarts_with_the_rest() {
    let cluster = Cluster::start(2, 2, test_config()).await;
    let clients = cluster.clients.clone();
    let trustees = cluster.trustees.clone();
    wait_until(Duration::from_secs(30), "cells to flow", || {
        clients.iter().all(|c| c.status().cells_sent > 0)
    })
    .await;

    let before = clients[0].status().setups;
    cluster.stop_trustee(0);
    wait_until(Duration::from_secs(30), "a run without trustee 0", || {
        trustees[1].status().setups > 1
            && clients
                .iter()
                .all(|c| c.status().setups > before && c.status().slot.is_some())
    })
    .await;
    assert!(!trustees[0].status().connected);

    let reports = cluster.shutdown().await;
    assert!(reports.len() >= 2);
    let departure = reports
        .iter()
        .filter_map(|r| r.resync_reason.as_deref())
        .any(|reason| reason.contains("transport closed"));
    assert!(departure, "no departure among {:?}", reports);

    let last = reports.last().unwrap();
    assert_eq!(last.trustee_cells, last.decoded_rounds as u64);
}

#[tokio::test]
async fn test_tampered_shuffle_bans_the_trustee() {
    let provers: Vec<(usize, Arc<dyn ShuffleProver>)> = vec![(1, Arc::new(TamperingProver))];
    let cluster = Cluster::start_with(2, 2, test_config(), provers).await;
    let tamperer = cluster.keys.trustees[1].public();
    let relay = cluster.relay.clone();
    let clients = cluster.clients.clone();
    let trustees = cluster.trustees.clone();

    wait_until(Duration::from_secs(30), "the tamperer to be banned", || {
        relay.banned().contains(&tamperer)
    })
    .await;
    wait_until(Duration::from_secs(30), "the tamperer to be refused", || {
        trustees[1]
            .status()
            .last_error
            .map_or(false, |e| e.contains("relay rejected"))
    })
    .await;
    wait_until(Duration::from_secs(30), "a run with the honest trustee", || {
        clients
            .iter()
            .all(|c| c.status().setups >= 1 && c.status().cells_sent > 0)
    })
    .await;
    assert_eq!(trustees[1].status().setups, 0);

    let reports = cluster.shutdown().await;
    let caught = reports
        .iter()
        .filter_map(|r| r.resync_reason.as_deref())
        .any(|reason| reason.contains("cryptographic invariant"));
    assert!(caught, "no failed shuffle among {:?}", reports);
}

/// Plays the relay by hand up to the schedule, which `schedule` builds.
async fn client_against_schedule<F>(schedule: F) -> (Option<String>, TcpListener)
where
    F: FnOnce(&SecretKey) -> Message,
{
    let client_key = SecretKey::generate();
    let trustee_key = SecretKey::generate();
    let roster = Roster {
        trustees: vec![RosterEntry {
            id: 0,
            public_key: trustee_key.public(),
        }],
        clients: vec![RosterEntry {
            id: FIRST_CLIENT_ID,
            public_key: client_key.public(),
        }],
    };
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let client = Client::new(Suite, addr, FIRST_CLIENT_ID, client_key, test_config()).unwrap();
    let handle = client.handle();
    let (stop, shutdown) = watch::channel(());
    let task = tokio::spawn(client.run(shutdown));

    let (mut stream, _) = within(Duration::from_secs(5), listener.accept())
        .await
        .unwrap();
    let who = authenticate_peer(&mut stream, &roster, |_| false)
        .await
        .unwrap();
    assert_eq!(who.roster_id, FIRST_CLIENT_ID);

    send(
        &mut stream,
        Message::Parameters(Parameters {
            n_clients: 1,
            n_trustees: 1,
            up_cell_size: 128,
            down_cell_size: 128,
            window_size: 1,
            use_udp: false,
            use_dummy_data_down: false,
            reporting_limit: 0,
            start_now: true,
            dcnet_type: DcNetType::Plain,
            participant_id: 0,
            udp_port: 0,
            do_latency_tests: false,
        }),
    )
    .await;
    send(
        &mut stream,
        Message::TrusteeKeys {
            trustees: vec![trustee_key.public()],
        },
    )
    .await;
    let keys = within(Duration::from_secs(5), read_message(&mut stream, MAX_FRAME_SIZE))
        .await
        .unwrap();
    assert!(matches!(
        Message::decode(&keys).unwrap(),
        Message::ClientKeys { .. }
    ));

    send(&mut stream, schedule(&trustee_key)).await;
    let closed = within(Duration::from_secs(5), read_message(&mut stream, MAX_FRAME_SIZE)).await;
    assert!(closed.is_err(), "client kept the connection: {:?}", closed);

    wait_until(Duration::from_secs(5), "the client to record the failure", || {
        handle.status().last_error.is_some()
    })
    .await;
    let error = handle.status().last_error;
    assert_eq!(handle.status().setups, 0);

    let _ = stop.send(());
    let _ = task.await;
    (error, listener)
}

async fn send(stream: &mut TcpStream, msg: Message) {
    write_message(stream, &msg.encode()).await.unwrap();
}

fn random_schedule(signer: &SecretKey, sign_as: Option<&SecretKey>) -> Message {
    let mut rng = rand::thread_rng();
    let base = Suite.random_point(&mut rng);
    let ephemerals = vec![Suite.random_point(&mut rng)];
    let payload = ShuffleTranscript::signed_payload(&base, &ephemerals);
    let signature = Signature::sign(sign_as.unwrap_or(signer), SCHEDULE_CONTEXT, &payload);
    Message::Schedule {
        base,
        ephemerals,
        signatures: vec![signature],
    }
}

#[tokio::test]
async fn test_client_without_a_slot_leaves_the_run() {
    let (error, _listener) = client_against_schedule(|trustee| random_schedule(trustee, None)).await;
    let error = error.unwrap();
    assert!(error.contains("no ephemeral key"), "unexpected error: {}", error);
}

#[tokio::test]
async fn test_client_refuses_a_forged_schedule() {
    let forger = SecretKey::generate();
    let (error, _listener) =
        client_against_schedule(|trustee| random_schedule(trustee, Some(&forger))).await;
    let error = error.unwrap();
    assert!(error.contains("does not verify"), "unexpected error: {}", error);
}

#[tokio::test]
async fn test_client_reconnects_after_a_failed_setup() {
    let client_key = SecretKey::generate();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let client = Client::new(Suite, addr, FIRST_CLIENT_ID, client_key, test_config()).unwrap();
    let (stop, shutdown) = watch::channel(());
    let task = tokio::spawn(client.run(shutdown));

    let (first, _) = within(Duration::from_secs(5), listener.accept())
        .await
        .unwrap();
    drop(first);
    let second = within(Duration::from_secs(5), listener.accept()).await;
    assert!(second.is_ok());

    let _ = stop.send(());
    let _ = task.await;
}
