//! RPC coordinator behavior.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use nettable::core::SequenceNumber;
use nettable::storage::RpcResultError;
use nettable::{EntryType, Message, Storage, Value};

use crate::fixtures::{ChannelRpcHandler, MockConn, RecordingDispatcher, RecordingNotifier, Rig};

#[test]
fn create_rpc_assigns_id_and_announces() {
    let rig = Rig::server();
    let local_id = rig.storage.get_entry("func").unwrap();

    rig.storage.create_rpc(local_id, &b"def"[..], 12);

    assert_eq!(rig.storage.get_entry_type(local_id), EntryType::Rpc);
    let sent = rig.dispatcher.take();
    assert_eq!(sent.len(), 1);
    let Message::EntryAssign { id, seq_num, .. } = &sent[0].msg else {
        panic!("expected assign, got {:?}", sent[0].msg);
    };
    assert_eq!(*id, 0);
    assert_eq!(*seq_num, SequenceNumber::new(1));

    // Re-creating with the same definition is silent.
    rig.storage.create_rpc(local_id, &b"def"[..], 12);
    assert!(rig.dispatcher.take().is_empty());
}

#[test]
fn call_rpc_on_non_rpc_entry_returns_zero() {
    let rig = Rig::server();
    rig.storage.set_entry_type_value("plain", Value::double(1.0));
    let local_id = rig.storage.get_entry("plain").unwrap();
    assert_eq!(rig.storage.call_rpc(local_id, "params"), 0);
    assert_eq!(rig.storage.call_rpc(9999, "params"), 0);
}

#[test]
fn server_call_runs_inline_and_result_is_retrievable() {
    let rig = Rig::server(); // EchoRpcHandler answers inline
    let local_id = rig.storage.get_entry("func").unwrap();
    rig.storage.create_rpc(local_id, &b"def"[..], 12);

    let call_uid = rig.storage.call_rpc(local_id, "ping");
    assert_eq!(call_uid, 1);

    let result = rig
        .storage
        .get_rpc_result(local_id, call_uid, None)
        .unwrap();
    assert_eq!(result, "echo:ping");

    // The result was consumed; a zero-timeout poll misses now.
    assert_eq!(
        rig.storage
            .get_rpc_result(local_id, call_uid, Some(Duration::ZERO)),
        Err(RpcResultError::Cancelled)
    );
}

#[test]
fn call_uids_count_up_per_entry() {
    let rig = Rig::server();
    let local_id = rig.storage.get_entry("func").unwrap();
    rig.storage.create_rpc(local_id, &b"def"[..], 12);
    assert_eq!(rig.storage.call_rpc(local_id, "a"), 1);
    assert_eq!(rig.storage.call_rpc(local_id, "b"), 2);
    assert_eq!(rig.storage.call_rpc(local_id, "c"), 3);
}

#[test]
fn client_call_queues_execute_rpc_and_response_completes_it() {
    let rig = Rig::client();
    let conn = MockConn::new(0x0300, "server");

    // The RPC definition arrives from the server.
    rig.storage.process_incoming(
        Message::EntryAssign {
            name: "func".to_string(),
            id: 4,
            seq_num: SequenceNumber::new(1),
            value: Value::rpc(&b"def"[..]),
            flags: 0,
        },
        &conn,
    );
    rig.dispatcher.take();
    let local_id = rig.storage.get_entry("func").unwrap();

    let call_uid = rig.storage.call_rpc(local_id, "ping");
    assert_eq!(call_uid, 1);
    let sent = rig.dispatcher.take();
    assert_eq!(sent.len(), 1);
    assert_eq!(
        sent[0].msg,
        Message::ExecuteRpc {
            id: 4,
            call_uid,
            params: "ping".to_string()
        }
    );

    rig.storage.process_incoming(
        Message::RpcResponse {
            id: 4,
            call_uid,
            result: "pong".to_string(),
        },
        &conn,
    );

    let result = rig
        .storage
        .get_rpc_result(local_id, call_uid, Some(Duration::from_secs(5)))
        .unwrap();
    assert_eq!(result, "pong");
}

#[test]
fn get_rpc_result_times_out() {
    let rig = Rig::server();
    let local_id = rig.storage.get_entry("func").unwrap();
    assert_eq!(
        rig.storage
            .get_rpc_result(local_id, 7, Some(Duration::from_millis(20))),
        Err(RpcResultError::TimedOut)
    );
}

#[test]
fn cancel_unblocks_a_waiter() {
    let notifier = Arc::new(RecordingNotifier::default());
    let dispatcher = Arc::new(RecordingDispatcher::default());
    let (handler, _calls) = ChannelRpcHandler::new();
    let storage = Arc::new(Storage::new(notifier, handler));
    storage.set_dispatcher(dispatcher, true);

    let waiter = {
        let storage = Arc::clone(&storage);
        thread::spawn(move || storage.get_rpc_result(1, 2, None))
    };
    // Give the waiter time to block before cancelling.
    thread::sleep(Duration::from_millis(50));
    storage.cancel_rpc_result(1, 2);
    assert_eq!(waiter.join().unwrap(), Err(RpcResultError::Cancelled));
}

#[test]
fn terminate_unblocks_all_waiters() {
    let notifier = Arc::new(RecordingNotifier::default());
    let (handler, _calls) = ChannelRpcHandler::new();
    let storage = Arc::new(Storage::new(notifier, handler));

    let waiter = {
        let storage = Arc::clone(&storage);
        thread::spawn(move || storage.get_rpc_result(3, 4, None))
    };
    thread::sleep(Duration::from_millis(50));
    storage.terminate();
    assert_eq!(waiter.join().unwrap(), Err(RpcResultError::Cancelled));
}

#[test]
fn duplicate_blocking_wait_is_rejected() {
    let notifier = Arc::new(RecordingNotifier::default());
    let (handler, _calls) = ChannelRpcHandler::new();
    let storage = Arc::new(Storage::new(notifier, handler));

    let waiter = {
        let storage = Arc::clone(&storage);
        thread::spawn(move || storage.get_rpc_result(5, 6, Some(Duration::from_secs(2))))
    };
    thread::sleep(Duration::from_millis(50));
    assert_eq!(
        storage.get_rpc_result(5, 6, Some(Duration::ZERO)),
        Err(RpcResultError::Cancelled)
    );
    storage.cancel_rpc_result(5, 6);
    assert_eq!(waiter.join().unwrap(), Err(RpcResultError::Cancelled));
}

#[test]
fn deferred_handler_response_wakes_the_waiter() {
    let notifier = Arc::new(RecordingNotifier::default());
    let dispatcher = Arc::new(RecordingDispatcher::default());
    let (handler, calls) = ChannelRpcHandler::new();
    let storage = Arc::new(Storage::new(notifier, handler));
    storage.set_dispatcher(dispatcher, true);

    let local_id = storage.get_entry("slow").unwrap();
    storage.create_rpc(local_id, &b"def"[..], 1);
    let call_uid = storage.call_rpc(local_id, "work");

    // Answer from another thread after a delay.
    let responder = thread::spawn(move || {
        let call = calls.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(call.params, "work");
        assert_eq!(call.conn.remote_id, "Server");
        assert_eq!(call.rpc_uid, Some(1));
        thread::sleep(Duration::from_millis(30));
        (call.respond)("done".to_string());
    });

    let result = storage
        .get_rpc_result(local_id, call_uid, Some(Duration::from_secs(5)))
        .unwrap();
    assert_eq!(result, "done");
    responder.join().unwrap();
}

#[test]
fn incoming_execute_rpc_responds_on_the_origin_connection() {
    let notifier = Arc::new(RecordingNotifier::default());
    let dispatcher = Arc::new(RecordingDispatcher::default());
    let (handler, calls) = ChannelRpcHandler::new();
    let storage = Storage::new(notifier, handler);
    storage.set_dispatcher(dispatcher, true);

    let local_id = storage.get_entry("func").unwrap();
    storage.create_rpc(local_id, &b"def"[..], 12);

    let (mock, conn) = MockConn::recording(0x0300, "client-a");
    storage.process_incoming(
        Message::ExecuteRpc {
            id: 0,
            call_uid: 3,
            params: "ping".to_string(),
        },
        &conn,
    );

    let call = calls.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(call.local_id, local_id);
    assert_eq!(call.call_uid, 3);
    assert_eq!(call.name, "func");
    assert_eq!(call.conn.remote_id, "client-a");
    (call.respond)("pong".to_string());

    // The response lands on the originating connection.
    assert_eq!(
        *mock.sent.lock().unwrap(),
        vec![Message::RpcResponse {
            id: 0,
            call_uid: 3,
            result: "pong".to_string()
        }]
    );
}

#[test]
fn rpc_response_after_connection_death_is_dropped() {
    let notifier = Arc::new(RecordingNotifier::default());
    let dispatcher = Arc::new(RecordingDispatcher::default());
    let (handler, calls) = ChannelRpcHandler::new();
    let storage = Storage::new(notifier, handler);
    storage.set_dispatcher(dispatcher, true);

    let local_id = storage.get_entry("func").unwrap();
    storage.create_rpc(local_id, &b"def"[..], 12);

    let conn = MockConn::new(0x0300, "client-a");
    storage.process_incoming(
        Message::ExecuteRpc {
            id: 0,
            call_uid: 1,
            params: "ping".to_string(),
        },
        &conn,
    );
    drop(conn);

    let call = calls.recv_timeout(Duration::from_secs(5)).unwrap();
    // The connection is gone; responding must not panic.
    (call.respond)("pong".to_string());
}

#[test]
fn execute_rpc_is_server_only_and_checked() {
    let rig = Rig::client();
    let conn = MockConn::new(0x0300, "server");
    rig.storage.process_incoming(
        Message::ExecuteRpc {
            id: 0,
            call_uid: 1,
            params: "p".to_string(),
        },
        &conn,
    );

    let rig = Rig::server();
    let conn = MockConn::new(0x0300, "client-a");
    rig.storage.set_entry_type_value("plain", Value::double(1.0));
    // Calls to non-RPC entries and unknown ids are dropped.
    rig.storage.process_incoming(
        Message::ExecuteRpc {
            id: 0,
            call_uid: 1,
            params: "p".to_string(),
        },
        &conn,
    );
    rig.storage.process_incoming(
        Message::ExecuteRpc {
            id: 5,
            call_uid: 1,
            params: "p".to_string(),
        },
        &conn,
    );
}

#[test]
fn deleting_an_rpc_entry_unregisters_the_handler() {
    let notifier = Arc::new(RecordingNotifier::default());
    let dispatcher = Arc::new(RecordingDispatcher::default());
    let (handler, _calls) = ChannelRpcHandler::new();
    let handler_for_storage = Arc::clone(&handler);
    let storage = Storage::new(notifier, handler_for_storage);
    storage.set_dispatcher(dispatcher, true);

    let local_id = storage.get_entry("func").unwrap();
    storage.create_rpc(local_id, &b"def"[..], 42);
    storage.delete_entry("func");

    assert_eq!(*handler.removed.lock().unwrap(), vec![42]);
}
