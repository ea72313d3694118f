mod common;

use std::time::Duration;

use chrono::{TimeZone, Utc};

use parley_client::{NodeError, NodeEvent};
use parley_net::{BoxedStream, MemoryNetwork, NetworkFabric};
use parley_shared::constants::{CHAT_PROTOCOL, MIME_TEXT};
use parley_shared::frame::{encode_frame, read_frame, write_frame, FrameRead};
use parley_shared::protocol::{ChatMessage, ResendRequest};
use parley_shared::{ChatId, DataPacket, MessageId};
use parley_store::Message;

use common::*;

fn message(chat: &ChatId, id: &str, prev: Option<&str>, author: &str, text: &str, secs: i64) -> Message {
    Message {
        id: MessageId::from(id),
        prev: prev.map(MessageId::from),
        chat_id: chat.clone(),
        author: peer(author),
        text: text.to_string(),
        sent: Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap(),
    }
}

fn wire(message: &Message) -> DataPacket {
    DataPacket::Message(ChatMessage {
        chat_id: message.chat_id.clone(),
        message_id: message.id.clone(),
        prev_message_id: message.prev.clone(),
        payload: message.text.as_bytes().to_vec(),
        author_id: message.author.clone(),
        mime_type: MIME_TEXT.to_string(),
        sent: message.sent.timestamp_nanos_opt().unwrap(),
    })
}

async fn send(stream: &mut BoxedStream, packet: &DataPacket) {
    write_frame(stream, &encode_frame(packet).unwrap()).await.unwrap();
}

/// Next packet other than ping traffic, or `None` after `wait`.
async fn next_packet(stream: &mut BoxedStream, wait: Duration) -> Option<DataPacket> {
    let read = async {
        loop {
            match read_frame(stream).await {
                Ok(FrameRead::Packet(DataPacket::Ping | DataPacket::Pong)) => continue,
                Ok(FrameRead::Packet(packet)) => return Some(packet),
                Ok(_) => continue,
                Err(_) => return None,
            }
        }
    };
    tokio::time::timeout(wait, read).await.ok().flatten()
}

/// Read frames until a `Pong` arrives. Frames are handled in order, so
/// everything sent before the matching `Ping` has been processed by then.
async fn wait_for_pong(stream: &mut BoxedStream, wait: Duration) -> bool {
    let read = async {
        loop {
            match read_frame(stream).await {
                Ok(FrameRead::Packet(DataPacket::Pong)) => return true,
                Ok(_) => continue,
                Err(_) => return false,
            }
        }
    };
    tokio::time::timeout(wait, read).await.unwrap_or(false)
}

fn ids(messages: &[Message]) -> Vec<MessageId> {
    let mut ids: Vec<_> = messages.iter().map(|m| m.id.clone()).collect();
    ids.sort();
    ids
}

fn texts(messages: &[Message]) -> Vec<&str> {
    messages.iter().map(|m| m.text.as_str()).collect()
}

#[tokio::test]
async fn live_messages_flow_both_ways() {
    let net = MemoryNetwork::new();
    let a = start_node(&net, "A", memory_store()).await;
    let b = start_node(&net, "B", memory_store()).await;
    let mut b_events = b.node.subscribe();

    a.node.add_contact(peer("B"), "Bob", vec![]).await.unwrap();
    b.node.add_contact(peer("A"), "Alice", vec![]).await.unwrap();
    wait_connected(&a.node, &b.node).await;

    let chat = direct_chat("A", "B");
    let m1 = a.node.send_message(&chat, "hello").await.unwrap();
    assert_eq!(m1.prev, None);

    let bn = &b.node;
    let chat_ref = &chat;
    eventually("B has the first message", || async move {
        bn.messages(chat_ref).await.unwrap().len() == 1
    })
    .await;

    let m2 = b.node.send_message(&chat, "hi back").await.unwrap();
    assert_eq!(m2.prev, Some(m1.id.clone()));

    let an = &a.node;
    eventually("A has the reply", || async move {
        an.messages(chat_ref).await.unwrap().len() == 2
    })
    .await;
    assert_eq!(texts(&a.node.messages(&chat).await.unwrap()), vec!["hello", "hi back"]);
    assert_eq!(texts(&b.node.messages(&chat).await.unwrap()), vec!["hello", "hi back"]);

    let mut saw_new_message = false;
    while let Ok(event) = b_events.try_recv() {
        if let NodeEvent::NewMessage { message_id, .. } = event {
            saw_new_message |= message_id == m1.id;
        }
    }
    assert!(saw_new_message);
}

#[tokio::test]
async fn offline_peer_gets_message_when_it_comes_online() {
    let net = MemoryNetwork::new();
    let a = start_node(&net, "A", memory_store()).await;
    a.node.add_contact(peer("B"), "Bob", vec![]).await.unwrap();

    let chat = direct_chat("A", "B");
    let sent = a.node.send_message(&chat, "hi").await.unwrap();
    assert!(a.node.connected_peers().await.is_empty());

    let b_store = memory_store();
    seed_contact(&b_store, "B", "A");
    let b = start_node(&net, "B", b_store).await;

    let bn = &b.node;
    let chat_ref = &chat;
    eventually("B received hi", || async move {
        !bn.messages(chat_ref).await.unwrap().is_empty()
    })
    .await;

    let received = b.node.messages(&chat).await.unwrap();
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].id, sent.id);
    assert_eq!(received[0].text, "hi");
    assert_eq!(received[0].prev, None);
    assert_eq!(b.store.list_messages(&chat).unwrap().len(), 1);
}

#[tokio::test]
async fn history_written_offline_is_pulled_in_full() {
    let net = MemoryNetwork::new();
    let a = start_node(&net, "A", memory_store()).await;
    a.node.add_contact(peer("B"), "Bob", vec![]).await.unwrap();

    let chat = direct_chat("A", "B");
    for text in ["one", "two", "three"] {
        a.node.send_message(&chat, text).await.unwrap();
    }

    let b_store = memory_store();
    seed_contact(&b_store, "B", "A");
    let b = start_node(&net, "B", b_store).await;

    let bn = &b.node;
    let chat_ref = &chat;
    eventually("B rebuilt the chain", || async move {
        bn.messages(chat_ref).await.unwrap().len() == 3
    })
    .await;

    let theirs = a.node.messages(&chat).await.unwrap();
    let ours = b.node.messages(&chat).await.unwrap();
    let strip = |ms: &[Message]| -> Vec<_> {
        ms.iter()
            .map(|m| (m.id.clone(), m.prev.clone(), m.author.clone(), m.text.clone()))
            .collect()
    };
    assert_eq!(strip(&ours), strip(&theirs));
    assert_eq!(b.node.select_chat(&chat).await.unwrap().waiting, 0);
}

#[tokio::test]
async fn message_persisted_before_a_crash_is_delivered_on_next_session() {
    let net = MemoryNetwork::new();
    let chat = direct_chat("A", "B");

    // A wrote m1 to its store, then died before sending it.
    let a_store = memory_store();
    seed_contact(&a_store, "A", "B");
    let m1 = message(&chat, "m1", None, "A", "before crash", 0);
    a_store.insert_message(&m1).unwrap();

    let b_store = memory_store();
    seed_contact(&b_store, "B", "A");

    let a = start_node(&net, "A", a_store).await;
    let b = start_node(&net, "B", b_store).await;
    wait_connected(&a.node, &b.node).await;

    let bn = &b.node;
    let chat_ref = &chat;
    eventually("B got m1", || async move {
        bn.messages(chat_ref).await.unwrap().len() == 1
    })
    .await;

    let m2 = a.node.send_message(&chat, "after restart").await.unwrap();
    assert_eq!(m2.prev, Some(m1.id.clone()));
    eventually("B got m2", || async move {
        bn.messages(chat_ref).await.unwrap().len() == 2
    })
    .await;

    tokio::time::sleep(Duration::from_millis(200)).await;
    let ids: Vec<_> = b.store.list_messages(&chat).unwrap().into_iter().map(|m| m.id).collect();
    assert_eq!(ids, vec![m1.id, m2.id]);
}

#[tokio::test]
async fn every_branch_of_a_fork_is_pulled() {
    let net = MemoryNetwork::new();
    let chat = direct_chat("A", "B");

    // Two devices of A wrote on top of m0 without seeing each other.
    let a_store = memory_store();
    seed_contact(&a_store, "A", "B");
    let m0 = message(&chat, "m0", None, "A", "root", 0);
    let left = message(&chat, "mA", Some("m0"), "A", "left", 1);
    let right = message(&chat, "mB", Some("m0"), "A", "right", 2);
    for m in [&m0, &left, &right] {
        a_store.insert_message(m).unwrap();
    }

    let b_store = memory_store();
    seed_contact(&b_store, "B", "A");
    let a = start_node(&net, "A", a_store).await;
    let b = start_node(&net, "B", b_store).await;
    wait_connected(&a.node, &b.node).await;

    let bn = &b.node;
    let chat_ref = &chat;
    eventually("B holds both branches", || async move {
        bn.messages(chat_ref).await.unwrap().len() == 3
    })
    .await;
    assert_eq!(ids(&b.node.messages(&chat).await.unwrap()), ids(&[m0, left, right]));
    assert_eq!(b.store.list_messages(&chat).unwrap().len(), 3);
    assert_eq!(b.node.select_chat(&chat).await.unwrap().waiting, 0);
}

#[tokio::test]
async fn concurrent_sends_converge_on_both_sides() {
    let net = MemoryNetwork::new();
    let a = start_node(&net, "A", memory_store()).await;
    let b = start_node(&net, "B", memory_store()).await;
    a.node.add_contact(peer("B"), "Bob", vec![]).await.unwrap();
    b.node.add_contact(peer("A"), "Alice", vec![]).await.unwrap();
    wait_connected(&a.node, &b.node).await;

    let chat = direct_chat("A", "B");
    let (an, bn, chat_ref) = (&a.node, &b.node, &chat);
    let burst = |node: &'static str| async move {
        let target = if node == "A" { an } else { bn };
        for i in 0..5 {
            target.send_message(chat_ref, &format!("{node}{i}")).await.unwrap();
        }
    };
    tokio::join!(burst("A"), burst("B"));

    eventually("both sides hold all ten", || async move {
        an.messages(chat_ref).await.unwrap().len() == 10 && bn.messages(chat_ref).await.unwrap().len() == 10
    })
    .await;
    let theirs = a.node.messages(&chat).await.unwrap();
    let ours = b.node.messages(&chat).await.unwrap();
    assert_eq!(ids(&theirs), ids(&ours));
    assert_eq!(theirs.last().map(|m| &m.id), ours.last().map(|m| &m.id));
}

#[tokio::test]
async fn ping_is_answered_with_pong() {
    let net = MemoryNetwork::new();
    let b_store = memory_store();
    seed_contact(&b_store, "B", "A");
    let _b = start_node(&net, "B", b_store).await;

    let raw_a = net.join("A");
    let mut stream = raw_a.open_stream(&peer("B"), CHAT_PROTOCOL).await.unwrap();
    for _ in 0..3 {
        send(&mut stream, &DataPacket::Ping).await;
        assert!(wait_for_pong(&mut stream, Duration::from_secs(5)).await);
    }
}

#[tokio::test]
async fn message_lost_to_a_store_error_is_asked_for_again() {
    let net = MemoryNetwork::new();
    let chat = direct_chat("A", "B");
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("parley.db");
    let b_store = std::sync::Arc::new(parley_store::Store::open_at(&path, None, FAST_KDF).unwrap());
    seed_contact(&b_store, "B", "A");
    let b = start_node(&net, "B", b_store).await;

    // Message writes fail until the trigger is dropped.
    let side = rusqlite::Connection::open(&path).unwrap();
    side.execute_batch(
        "CREATE TRIGGER refuse_messages BEFORE INSERT ON kv WHEN NEW.key LIKE 'msg:%'
         BEGIN SELECT RAISE(ABORT, 'disk full'); END;",
    )
    .unwrap();

    let raw_a = net.join("A");
    let mut stream = raw_a.open_stream(&peer("B"), CHAT_PROTOCOL).await.unwrap();
    let m1 = message(&chat, "m1", None, "A", "first", 0);
    let m2 = message(&chat, "m2", Some("m1"), "A", "second", 1);
    send(&mut stream, &wire(&m1)).await;
    send(&mut stream, &DataPacket::Ping).await;
    assert!(wait_for_pong(&mut stream, Duration::from_secs(5)).await);
    assert!(b.node.messages(&chat).await.unwrap().is_empty());

    side.execute_batch("DROP TRIGGER refuse_messages;").unwrap();
    drop(stream);
    let bn = &b.node;
    eventually("B saw A go away", || async move {
        !bn.connected_peers().await.contains(&peer("A"))
    })
    .await;

    let mut stream = raw_a.open_stream(&peer("B"), CHAT_PROTOCOL).await.unwrap();
    match next_packet(&mut stream, Duration::from_secs(5)).await {
        Some(DataPacket::ResendRequest(request)) => assert_eq!(request.message_id, m1.id),
        other => panic!("expected a resend request, got {other:?}"),
    }
    send(&mut stream, &wire(&m1)).await;
    send(&mut stream, &wire(&m2)).await;

    let chat_ref = &chat;
    eventually("B stored m1 and m2", || async move {
        bn.messages(chat_ref).await.unwrap().len() == 2
    })
    .await;
    assert_eq!(b.store.list_messages(&chat).unwrap().len(), 2);
}

#[tokio::test]
async fn out_of_order_message_triggers_resend_request() {
    let net = MemoryNetwork::new();
    let chat = direct_chat("A", "B");
    let b_store = memory_store();
    seed_contact(&b_store, "B", "A");
    let b = start_node(&net, "B", b_store).await;

    // A is driven by hand so the arrival order is ours.
    let raw_a = net.join("A");
    let mut stream = raw_a.open_stream(&peer("B"), CHAT_PROTOCOL).await.unwrap();

    let m1 = message(&chat, "m1", None, "A", "first", 0);
    let m2 = message(&chat, "m2", Some("m1"), "A", "second", 1);
    send(&mut stream, &wire(&m2)).await;

    match next_packet(&mut stream, Duration::from_secs(5)).await {
        Some(DataPacket::ResendRequest(request)) => {
            assert_eq!(request.chat_id, chat);
            assert_eq!(request.message_id, m1.id);
        }
        other => panic!("expected a resend request, got {other:?}"),
    }
    assert!(b.node.messages(&chat).await.unwrap().is_empty());

    send(&mut stream, &wire(&m1)).await;

    let bn = &b.node;
    let chat_ref = &chat;
    eventually("B has m1 and m2", || async move {
        bn.messages(chat_ref).await.unwrap().len() == 2
    })
    .await;
    let messages = b.node.messages(&chat).await.unwrap();
    assert_eq!(messages[0].id, m1.id);
    assert_eq!(messages[1].prev, Some(m1.id.clone()));
}

#[tokio::test]
async fn resend_requests_are_only_served_to_members_for_known_messages() {
    let net = MemoryNetwork::new();
    let chat = direct_chat("A", "B");
    let b_store = memory_store();
    seed_contact(&b_store, "B", "A");
    let m1 = message(&chat, "m1", None, "B", "secret", 0);
    b_store.insert_message(&m1).unwrap();
    let _b = start_node(&net, "B", b_store).await;

    let request = |id: &str| {
        DataPacket::ResendRequest(ResendRequest {
            chat_id: chat.clone(),
            message_id: MessageId::from(id),
        })
    };

    // Outsider: nothing comes back.
    let mallory = net.join("M");
    let mut outsider = mallory.open_stream(&peer("B"), CHAT_PROTOCOL).await.unwrap();
    send(&mut outsider, &request("m1")).await;
    assert!(next_packet(&mut outsider, Duration::from_millis(300)).await.is_none());

    // Member: the head is announced first, unknown ids get no answer.
    let raw_a = net.join("A");
    let mut member = raw_a.open_stream(&peer("B"), CHAT_PROTOCOL).await.unwrap();
    assert_eq!(next_packet(&mut member, Duration::from_secs(5)).await, Some(wire(&m1)));

    send(&mut member, &request("nope")).await;
    assert!(next_packet(&mut member, Duration::from_millis(300)).await.is_none());

    send(&mut member, &request("m1")).await;
    assert_eq!(next_packet(&mut member, Duration::from_secs(5)).await, Some(wire(&m1)));
}

#[tokio::test]
async fn messages_from_non_members_are_dropped() {
    let net = MemoryNetwork::new();
    let chat = direct_chat("A", "B");
    let b_store = memory_store();
    seed_contact(&b_store, "B", "A");
    let b = start_node(&net, "B", b_store).await;

    let mallory = net.join("M");
    let mut stream = mallory.open_stream(&peer("B"), CHAT_PROTOCOL).await.unwrap();
    send(&mut stream, &wire(&message(&chat, "x1", None, "M", "spam", 0))).await;
    // Forged author does not help either.
    send(&mut stream, &wire(&message(&chat, "x2", None, "A", "spam", 0))).await;
    send(&mut stream, &DataPacket::Ping).await;

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(b.node.messages(&chat).await.unwrap().is_empty());
    assert!(b.store.list_messages(&chat).unwrap().is_empty());
}

#[tokio::test]
async fn group_chat_reaches_every_member() {
    let net = MemoryNetwork::new();
    let a = start_node(&net, "A", memory_store()).await;
    let b = start_node(&net, "B", memory_store()).await;
    let c = start_node(&net, "C", memory_store()).await;

    a.node.add_contact(peer("B"), "B", vec![]).await.unwrap();
    a.node.add_contact(peer("C"), "C", vec![]).await.unwrap();
    b.node.add_contact(peer("A"), "A", vec![]).await.unwrap();
    c.node.add_contact(peer("A"), "A", vec![]).await.unwrap();
    wait_connected(&a.node, &b.node).await;
    wait_connected(&a.node, &c.node).await;

    let group = a.node.create_group_chat("trio", &[peer("B"), peer("C")]).await.unwrap();
    assert_eq!(group.peers.len(), 3);
    let members = [peer("A"), peer("B"), peer("C")];
    b.node.join_group_chat(group.id.clone(), "trio", &members).await.unwrap_err();
    c.node.add_contact(peer("B"), "B", vec![]).await.unwrap();
    b.node.add_contact(peer("C"), "C", vec![]).await.unwrap();
    b.node.join_group_chat(group.id.clone(), "trio", &members).await.unwrap();
    c.node.join_group_chat(group.id.clone(), "trio", &members).await.unwrap();

    a.node.send_message(&group.id, "hi all").await.unwrap();

    let (bn, cn, gid) = (&b.node, &c.node, &group.id);
    eventually("B and C got the group message", || async move {
        bn.messages(gid).await.unwrap().len() == 1 && cn.messages(gid).await.unwrap().len() == 1
    })
    .await;
}

#[tokio::test]
async fn group_ids_with_separators_are_refused() {
    let net = MemoryNetwork::new();
    let b = start_node(&net, "B", memory_store()).await;
    b.node.add_contact(peer("A"), "A", vec![]).await.unwrap();

    let members = [peer("A"), peer("B")];
    let err = b.node.join_group_chat(ChatId::from("g:1"), "bad", &members).await.unwrap_err();
    assert!(matches!(err, NodeError::InvalidInput(_)), "{err}");
    assert!(b.node.chats().await.iter().all(|chat| chat.id != ChatId::from("g:1")));
}

#[tokio::test]
async fn adding_a_contact_twice_is_refused() {
    let net = MemoryNetwork::new();
    let a = start_node(&net, "A", memory_store()).await;
    a.node.add_contact(peer("B"), "Bob", vec![]).await.unwrap();
    let err = a.node.add_contact(peer("B"), "Robert", vec![]).await.unwrap_err();
    assert!(matches!(err, parley_client::NodeError::ContactExists(_)));
    assert_eq!(a.node.contacts().await[0].alias, "Bob");
    assert_eq!(a.node.chats().await.len(), 1);
}

#[tokio::test]
async fn selecting_a_chat_shuffles_its_members() {
    let net = MemoryNetwork::new();
    let a = start_node(&net, "A", memory_store()).await;
    a.node.add_contact(peer("B"), "Bob", vec![]).await.unwrap();
    a.node.add_contact(peer("C"), "Cy", vec![]).await.unwrap();
    let group = a.node.create_group_chat("g", &[peer("B"), peer("C")]).await.unwrap();

    let view = a.node.select_chat(&group.id).await.unwrap();
    let mut peers = view.peers.clone();
    peers.sort();
    assert_eq!(peers, vec![peer("A"), peer("B"), peer("C")]);
    assert_eq!(a.node.selected_chat().await.unwrap().id, group.id);

    let err = a.node.select_chat(&ChatId::from("missing")).await.unwrap_err();
    assert!(matches!(err, parley_client::NodeError::UnknownChat(_)));
}
