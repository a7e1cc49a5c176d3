//! A client that disappears mid-session — the control channel simply
//! closes — is observed through the dispatch loop's `recv` error and
//! collapses the node the same way an explicit destroy would.

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use client_node::{ClientNode, Collaborators, Lifecycle};
use spa_support::EventLoop;

fn unique_socket_path() -> std::path::PathBuf {
    static COUNTER: AtomicU32 = AtomicU32::new(0);
    let n = COUNTER.fetch_add(1, Ordering::Relaxed);
    std::env::temp_dir().join(format!("client-node-disconnect-{}-{n}.sock", std::process::id()))
}

#[tokio::test]
async fn client_disappearing_mid_session_tears_down_the_node() {
    let main_loop = EventLoop::new("disconnect-main").unwrap();
    let data_loop = EventLoop::new("disconnect-data").unwrap();
    let collaborators = Collaborators::default();
    let node = ClientNode::new(main_loop, data_loop, 2, 2, &collaborators);

    let path = unique_socket_path();
    let listener = client_rpc::Listener::bind(&path, 4).unwrap();
    let client = client_rpc::Connection::connect(&path).await.unwrap();
    let server = listener.accept().await.unwrap();

    node.lock().unwrap().bind_resource(server);
    collaborators.node_initialized.emit(&());
    assert_eq!(node.lock().unwrap().lifecycle(), Lifecycle::Resourced);

    drop(client);
    let _ = std::fs::remove_file(&path);

    // The dispatch loop notices the closed peer and begins destroy on its
    // own worker thread; poll instead of assuming it has already run.
    let deadline = std::time::Instant::now() + Duration::from_secs(2);
    loop {
        if node.lock().unwrap().lifecycle() == Lifecycle::Freed {
            break;
        }
        assert!(std::time::Instant::now() < deadline, "node was never torn down");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// An explicit destroy while a resource is bound behaves identically:
/// idempotent, and observable through the node's own destroy signal.
#[tokio::test]
async fn explicit_destroy_with_bound_resource_fires_destroy_signal_once() {
    let main_loop = EventLoop::new("disconnect-main2").unwrap();
    let data_loop = EventLoop::new("disconnect-data2").unwrap();
    let collaborators = Collaborators::default();
    let node = ClientNode::new(main_loop, data_loop, 2, 2, &collaborators);

    let path = unique_socket_path();
    let listener = client_rpc::Listener::bind(&path, 4).unwrap();
    let client = client_rpc::Connection::connect(&path).await.unwrap();
    let server = listener.accept().await.unwrap();
    node.lock().unwrap().bind_resource(server);
    collaborators.node_initialized.emit(&());

    let count = std::sync::Arc::new(AtomicU32::new(0));
    let count2 = count.clone();
    let _sub = node.lock().unwrap().subscribe_destroy(move |_| {
        count2.fetch_add(1, Ordering::Relaxed);
    });

    node.lock().unwrap().destroy();
    node.lock().unwrap().destroy();
    assert_eq!(count.load(Ordering::Relaxed), 1);
    assert_eq!(node.lock().unwrap().lifecycle(), Lifecycle::Freed);
    assert!(node.lock().unwrap().proxy().lock().unwrap().resource().is_none());

    drop(client);
    let _ = std::fs::remove_file(&path);
}
