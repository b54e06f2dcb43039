mod common;

use common::{FakeNode, eventually, fast_options, recording_gateway, track_json, voice_packets, wait_for};
use pmolink::{LinkConfig, LinkEvent, LinkManager, LoopMode, PlayerStatus, SessionOptions};
use serde_json::json;

async fn connected_manager(nodes: &[(&FakeNode, &str)]) -> (LinkManager, common::Commands) {
    let (commands, gateway) = recording_gateway();
    let configs = nodes.iter().map(|(fake, name)| fake.config(name)).collect();
    let manager = LinkManager::new(LinkConfig::new(configs, fast_options()), gateway).unwrap();
    let mut events = manager.subscribe();
    manager.init("bot").await.unwrap();
    for _ in nodes {
        wait_for(&mut events, |e| matches!(e, LinkEvent::NodeConnect { .. })).await;
    }
    (manager, commands)
}

async fn join_voice(manager: &LinkManager, guild: &str) {
    let (state, server) = voice_packets(guild, "bot", "c1");
    assert!(manager.update_voice_state(&state).await.unwrap());
    assert!(manager.update_voice_state(&server).await.unwrap());
}

#[tokio::test]
async fn test_playback_follows_the_queue() {
    let fake = FakeNode::start().await;
    let (manager, commands) = connected_manager(&[(&fake, "alpha")]).await;
    let mut events = manager.subscribe();

    let player = manager
        .create_session(SessionOptions::new("g1").voice_channel("c1"))
        .await
        .unwrap();
    {
        let commands = commands.lock().unwrap();
        let join = commands.last().unwrap();
        assert_eq!(join.guild_id, "g1");
        assert_eq!(join.channel_id.as_deref(), Some("c1"));
        assert!(join.self_deaf);
    }

    // Le paquet d'un autre utilisateur est ignoré
    let (foreign, _) = voice_packets("g1", "someone-else", "c1");
    assert!(!manager.update_voice_state(&foreign).await.unwrap());

    join_voice(&manager, "g1").await;
    assert!(player.is_connected().await);
    let voice = fake
        .updates()
        .into_iter()
        .find(|(_, body)| body.get("voice").is_some())
        .expect("voice was never sent");
    assert_eq!(voice.0, "g1");
    assert_eq!(voice.1["voice"]["token"], "voice-token");
    assert_eq!(voice.1["voice"]["sessionId"], "voice-session");

    let result = manager
        .search("anything", Some(json!({"id": "u1"})))
        .await
        .unwrap();
    assert_eq!(result.tracks.len(), 2);
    assert_eq!(result.tracks[0].requester, Some(json!({"id": "u1"})));

    assert_eq!(player.add_all(result.tracks).await, 2);
    let first = player.play().await.unwrap().unwrap();
    assert_eq!(first.identifier(), "abc");
    assert_eq!(player.status().await, PlayerStatus::Playing);
    assert!(fake
        .updates()
        .iter()
        .any(|(_, body)| body["track"]["encoded"] == "enc-abc"));

    fake.send(json!({
        "op": "event",
        "type": "TrackEndEvent",
        "guildId": "g1",
        "track": track_json("abc", "First"),
        "reason": "finished"
    }));
    wait_for(&mut events, |e| matches!(e, LinkEvent::TrackEnd { .. })).await;
    eventually(|| {
        fake.updates()
            .iter()
            .any(|(_, body)| body["track"]["encoded"] == "enc-def")
    })
    .await;

    fake.send(json!({
        "op": "event",
        "type": "TrackEndEvent",
        "guildId": "g1",
        "track": track_json("def", "Second"),
        "reason": "finished"
    }));
    let end = wait_for(&mut events, |e| matches!(e, LinkEvent::QueueEnd { .. })).await;
    match end {
        LinkEvent::QueueEnd { guild_id, last_track } => {
            assert_eq!(guild_id, "g1");
            assert_eq!(last_track.unwrap().identifier(), "def");
        }
        other => panic!("unexpected event {other:?}"),
    }
    assert_eq!(player.status().await, PlayerStatus::Idle);
    assert_eq!(player.previous().await.unwrap().identifier(), "def");

    manager.destroy().await;
}

#[tokio::test]
async fn test_session_moves_when_its_node_is_removed() {
    let alpha = FakeNode::start().await;
    let beta = FakeNode::start().await;
    let (manager, _commands) = connected_manager(&[(&alpha, "alpha"), (&beta, "beta")]).await;
    let mut events = manager.subscribe();

    let player = manager
        .create_session(SessionOptions::new("g1").voice_channel("c1"))
        .await
        .unwrap();
    let origin = player.node_name();
    let (origin_fake, target_fake, target) = if origin == "alpha" {
        (&alpha, &beta, "beta")
    } else {
        (&beta, &alpha, "alpha")
    };

    join_voice(&manager, "g1").await;
    let tracks = manager.search("anything", None).await.unwrap().tracks;
    player.add_all(tracks).await;
    player.play().await.unwrap();
    assert!(origin_fake
        .updates()
        .iter()
        .any(|(_, body)| body["track"]["encoded"] == "enc-abc"));

    manager.destroy_node(&origin).await.unwrap();

    let migrated = wait_for(&mut events, |e| matches!(e, LinkEvent::PlayerMigrated { .. })).await;
    assert_eq!(
        migrated,
        LinkEvent::PlayerMigrated {
            guild_id: "g1".to_string(),
            from: origin.clone(),
            to: target.to_string(),
        }
    );
    assert_eq!(player.node_name(), target);
    assert!(manager.node(&origin).is_none());

    // La lecture reprend sur la nouvelle node
    eventually(|| {
        target_fake
            .updates()
            .iter()
            .any(|(_, body)| body["track"]["encoded"] == "enc-abc")
    })
    .await;
    assert_eq!(player.current().await.unwrap().identifier(), "abc");

    manager.destroy().await;
}

#[tokio::test]
async fn test_state_survives_a_restart() {
    let fake = FakeNode::start().await;
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("sessions.json");

    {
        let (manager, _commands) = connected_manager(&[(&fake, "alpha")]).await;
        let player = manager
            .create_session(
                SessionOptions::new("g1")
                    .voice_channel("c1")
                    .text_channel("t1")
                    .volume(70)
                    .loop_mode(LoopMode::Queue),
            )
            .await
            .unwrap();
        let tracks = manager.search("anything", None).await.unwrap().tracks;
        player.add_all(tracks).await;
        player.set_data("dj", json!("u1")).await;

        assert_eq!(manager.save_state(&path).await.unwrap(), 1);
        manager.destroy().await;
    }

    let (manager, commands) = connected_manager(&[(&fake, "alpha")]).await;
    let mut events = manager.subscribe();
    assert_eq!(manager.load_state(&path).await.unwrap(), 1);

    let created = wait_for(&mut events, |e| matches!(e, LinkEvent::PlayerCreate { .. })).await;
    assert_eq!(created.guild_id(), Some("g1"));

    let player = manager.get("g1").unwrap();
    assert_eq!(player.volume().await, 70);
    assert_eq!(player.loop_mode().await, LoopMode::Queue);
    assert_eq!(player.text_channel().await.as_deref(), Some("t1"));
    assert_eq!(player.data("dj").await, Some(json!("u1")));
    let queue: Vec<String> = player
        .queue()
        .await
        .iter()
        .map(|t| t.identifier().to_string())
        .collect();
    assert_eq!(queue, vec!["abc", "def"]);

    // Le bot rejoint le salon vocal sauvegardé
    assert!(commands
        .lock()
        .unwrap()
        .iter()
        .any(|c| c.guild_id == "g1" && c.channel_id.as_deref() == Some("c1")));

    // Une seconde restauration ne duplique rien
    assert_eq!(manager.load_state(&path).await.unwrap(), 0);
    assert_eq!(manager.session_count(), 1);

    manager.destroy().await;
}

#[tokio::test]
async fn test_destroy_is_idempotent() {
    let fake = FakeNode::start().await;
    let (manager, commands) = connected_manager(&[(&fake, "alpha")]).await;
    let mut events = manager.subscribe();

    let player = manager
        .create_session(SessionOptions::new("g1").voice_channel("c1"))
        .await
        .unwrap();

    manager.destroy().await;
    manager.destroy().await;

    assert!(player.is_destroyed());
    assert_eq!(player.status().await, PlayerStatus::Destroyed);
    assert_eq!(manager.session_count(), 0);
    assert!(manager.nodes().is_empty());
    assert_eq!(fake.deleted(), vec!["g1".to_string()]);

    // Le bot quitte le salon vocal
    assert!(commands
        .lock()
        .unwrap()
        .iter()
        .any(|c| c.guild_id == "g1" && c.channel_id.is_none()));

    let mut destroyed_players = 0;
    let mut destroyed_nodes = 0;
    while let Ok(event) = events.try_recv() {
        match event {
            LinkEvent::PlayerDestroy { .. } => destroyed_players += 1,
            LinkEvent::NodeDestroy { .. } => destroyed_nodes += 1,
            _ => {}
        }
    }
    assert_eq!(destroyed_players, 1);
    assert_eq!(destroyed_nodes, 1);

    assert!(matches!(
        player.play().await,
        Err(pmolink::LinkError::SessionDestroyed(_))
    ));
}

#[tokio::test]
async fn test_session_moves_when_its_socket_drops() {
    let alpha = FakeNode::start().await;
    let beta = FakeNode::start().await;
    let (manager, _commands) = connected_manager(&[(&alpha, "alpha"), (&beta, "beta")]).await;
    let mut events = manager.subscribe();

    let player = manager
        .create_session(SessionOptions::new("g1").voice_channel("c1"))
        .await
        .unwrap();
    let origin = player.node_name();
    let (origin_fake, target_fake, target) = if origin == "alpha" {
        (&alpha, &beta, "beta")
    } else {
        (&beta, &alpha, "alpha")
    };

    join_voice(&manager, "g1").await;
    let tracks = manager.search("anything", None).await.unwrap().tracks;
    player.add_all(tracks).await;
    player.play().await.unwrap();

    // La node reste configurée, seul son socket tombe
    origin_fake.close_sockets();

    let migrated = wait_for(&mut events, |e| matches!(e, LinkEvent::PlayerMigrated { .. })).await;
    assert_eq!(
        migrated,
        LinkEvent::PlayerMigrated {
            guild_id: "g1".to_string(),
            from: origin.clone(),
            to: target.to_string(),
        }
    );
    assert_eq!(player.node_name(), target);
    eventually(|| {
        target_fake
            .updates()
            .iter()
            .any(|(_, body)| body["track"]["encoded"] == "enc-abc")
    })
    .await;

    manager.destroy().await;
}

#[tokio::test]
async fn test_destroyed_session_is_replaced() {
    let fake = FakeNode::start().await;
    let (manager, _commands) = connected_manager(&[(&fake, "alpha")]).await;

    let first = manager
        .create_session(SessionOptions::new("g1").voice_channel("c1"))
        .await
        .unwrap();
    first.destroy().await;
    assert!(first.is_destroyed());

    let second = manager
        .create_session(SessionOptions::new("g1").voice_channel("c1"))
        .await
        .unwrap();
    assert!(!std::sync::Arc::ptr_eq(&first, &second));
    assert!(!second.is_destroyed());
    assert!(std::sync::Arc::ptr_eq(&manager.get("g1").unwrap(), &second));
    assert_eq!(manager.session_count(), 1);

    join_voice(&manager, "g1").await;
    let tracks = manager.search("anything", None).await.unwrap().tracks;
    second.add_all(tracks).await;
    assert_eq!(second.play().await.unwrap().unwrap().identifier(), "abc");

    manager.destroy().await;
}
