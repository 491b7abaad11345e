use super::*;
use crate::session::fake::{FakeSpawner, FakeState};
use crate::session::pty::TIOCPKT_IOCTL;
use std::sync::{Arc, Mutex};
use ttyhub_core::{Geometry, HubError, LocalModes};

fn options() -> HubOptions {
    HubOptions {
        default_command: vec!["/bin/sh".into()],
        ..HubOptions::default()
    }
}

fn new_hub(options: HubOptions) -> (Hub, FakeSpawner) {
    let spawner = FakeSpawner::default();
    let hub = Hub::new(options, Box::new(spawner.clone()), None);
    (hub, spawner)
}

/// Connect a viewer and announce it, which links it to a new session.
fn connect(hub: &mut Hub) -> ConnId {
    let id = hub.viewer_connected(None).unwrap();
    hub.viewer_input(id, b"\x92VERSION test-viewer/1\n");
    id
}

/// Connect a viewer straight to the session running `pid`.
fn join(hub: &mut Hub, pid: u32) -> ConnId {
    hub.viewer_connected(Some(pid)).unwrap()
}

fn flush(hub: &mut Hub, id: ConnId) -> Vec<u8> {
    hub.viewer_writable(id).unwrap_or_default()
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|w| w == needle)
}

fn read_grants(effects: &[Effect]) -> Vec<usize> {
    effects
        .iter()
        .filter_map(|e| match e {
            Effect::ReadPty { max, .. } => Some(*max),
            _ => None,
        })
        .collect()
}

fn state(spawner: &FakeSpawner, index: usize) -> Arc<Mutex<FakeState>> {
    spawner.state(index)
}

fn session(hub: &Hub, number: SessionNumber) -> &PtySession {
    hub.registry().get(number).unwrap()
}

#[test]
fn version_spawns_and_links() {
    let (mut hub, spawner) = new_hub(options());
    let a = connect(&mut hub);

    assert_eq!(hub.viewer(a).unwrap().session, Some(1));
    let effects = hub.drain_effects();
    assert!(effects.contains(&Effect::StartPump(1)));
    assert_eq!(read_grants(&effects), vec![READ_CHUNK]);

    let frame = flush(&mut hub, a);
    assert!(frame.starts_with(b"\x13\x16\x1b]31;1000\x07\x1b[91;1;0\x07\x14"));
    assert!(contains(&frame, b"\x1b[91;1;0;0u"));

    let st = state(&spawner, 0);
    let st = st.lock().unwrap();
    assert_eq!(st.request.argv, vec!["/bin/sh"]);
    assert_eq!(st.request.session_number, 1);
}

#[test]
fn failed_spawn_leaves_viewer_unlinked() {
    let spawner = FakeSpawner {
        fail: true,
        ..FakeSpawner::default()
    };
    let mut hub = Hub::new(options(), Box::new(spawner), None);
    let a = connect(&mut hub);
    assert_eq!(hub.viewer(a).unwrap().session, None);
    assert!(hub.registry().is_empty());
}

#[test]
fn fan_out_is_identical_and_ordered() {
    let (mut hub, _spawner) = new_hub(options());
    let a = connect(&mut hub);
    let b = join(&mut hub, 1000);
    flush(&mut hub, a);
    flush(&mut hub, b);

    hub.pty_output(1, b"abc");
    hub.pty_output(1, b"def");

    assert_eq!(flush(&mut hub, a), b"abcdef");
    assert_eq!(flush(&mut hub, b), b"abcdef");
    assert_eq!(hub.viewer(a).unwrap().sent, 6);
    assert_eq!(hub.viewer(b).unwrap().sent, 6);
}

#[test]
fn window_numbers_are_lowest_unused() {
    let (mut hub, _spawner) = new_hub(options());
    let a = connect(&mut hub);
    assert_eq!(hub.viewer(a).unwrap().window_number, None);

    let b = join(&mut hub, 1000);
    let c = join(&mut hub, 1000);
    assert_eq!(hub.viewer(a).unwrap().window_number, Some(0));
    assert_eq!(hub.viewer(b).unwrap().window_number, Some(1));
    assert_eq!(hub.viewer(c).unwrap().window_number, Some(2));

    hub.viewer_closed(b);
    let d = join(&mut hub, 1000);
    assert_eq!(hub.viewer(d).unwrap().window_number, Some(1));

    flush(&mut hub, a);
    hub.viewer_closed(c);
    hub.viewer_closed(d);
    let viewer = hub.viewer(a).unwrap();
    assert_eq!(viewer.window_number, None);
    assert_eq!(viewer.window_slot(), 0);

    let frame = flush(&mut hub, a);
    assert!(contains(&frame, b"\x1b[91;1;0;0u"));
    assert!(contains(&frame, b"\x1b[82;1u"));
}

#[test]
fn second_viewer_triggers_window_updates_and_detach_notices() {
    let (mut hub, _spawner) = new_hub(options());
    let a = connect(&mut hub);
    flush(&mut hub, a);
    hub.drain_effects();

    let b = join(&mut hub, 1000);
    assert!(hub.drain_effects().contains(&Effect::Writable(a)));

    let frame_a = flush(&mut hub, a);
    assert!(contains(&frame_a, b"\x1b[91;1;0;1u"));
    assert!(contains(&frame_a, b"\x1b[82;0u"));
    let frame_b = flush(&mut hub, b);
    assert!(contains(&frame_b, b"\x1b[91;1;0;2u"));
    assert!(contains(&frame_b, b"\x1b[82;0u"));
    assert_eq!(hub.focused, Some(b));
}

#[test]
fn slowest_viewer_pauses_reads_until_it_confirms() {
    let (mut hub, _spawner) = new_hub(options());
    let a = connect(&mut hub);
    let b = join(&mut hub, 1000);
    flush(&mut hub, a);
    flush(&mut hub, b);
    hub.drain_effects();

    let chunk = vec![b'x'; READ_CHUNK];
    hub.pty_output(1, &chunk);
    assert_eq!(read_grants(&hub.drain_effects()), vec![READ_CHUNK]);
    hub.pty_output(1, &chunk);
    assert!(read_grants(&hub.drain_effects()).is_empty());
    assert!(session(&hub, 1).paused);

    flush(&mut hub, a);
    flush(&mut hub, b);
    assert_eq!(hub.viewer(a).unwrap().sent, 8192);

    // B keeps up; A does not.
    hub.viewer_input(b, b"\x92RECEIVED 8192\n");
    assert!(read_grants(&hub.drain_effects()).is_empty());
    assert!(session(&hub, 1).paused);

    hub.viewer_input(a, b"\x92RECEIVED 8192\n");
    assert_eq!(read_grants(&hub.drain_effects()), vec![READ_CHUNK]);
    assert!(!session(&hub, 1).paused);
}

#[test]
fn stale_acknowledgement_is_ignored() {
    let (mut hub, _spawner) = new_hub(options());
    let a = connect(&mut hub);
    hub.pty_output(1, &vec![b'y'; 3000]);
    flush(&mut hub, a);

    hub.viewer_input(a, b"\x92RECEIVED 2500\n");
    assert_eq!(hub.viewer(a).unwrap().confirmed, 2500);
    hub.viewer_input(a, b"\x92RECEIVED 100\n");
    assert_eq!(hub.viewer(a).unwrap().confirmed, 2500);
    hub.viewer_input(a, b"\x92RECEIVED 9000\n");
    assert_eq!(hub.viewer(a).unwrap().confirmed, 2500);
}

#[test]
fn no_viewers_means_paused() {
    let (mut hub, _spawner) = new_hub(options());
    let a = connect(&mut hub);
    hub.viewer_input(a, b"\x92DETACH 1\n");
    hub.pty_output(1, b"x");
    hub.drain_effects();
    hub.viewer_closed(a);
    assert!(session(&hub, 1).paused);
    assert!(read_grants(&hub.drain_effects()).is_empty());
}

#[test]
fn preserved_session_survives_close_and_reattach() {
    let (mut hub, _spawner) = new_hub(options());
    let a = connect(&mut hub);
    flush(&mut hub, a);
    hub.viewer_input(a, b"\x92DETACH 1\n");
    hub.drain_effects();

    hub.viewer_closed(a);
    let effects = hub.drain_effects();
    assert!(!effects
        .iter()
        .any(|e| matches!(e, Effect::ScheduleShutdown { .. } | Effect::Exit)));
    assert_eq!(session(&hub, 1).detach_count, 1);

    let b = join(&mut hub, 1000);
    assert_eq!(hub.viewer(b).unwrap().session, Some(1));
    assert_eq!(session(&hub, 1).detach_count, 0);
}

#[test]
fn reattach_cancels_deferred_shutdown() {
    let (mut hub, spawner) = new_hub(options());
    let a = connect(&mut hub);
    hub.drain_effects();
    hub.viewer_closed(a);

    let token = hub
        .drain_effects()
        .iter()
        .find_map(|e| match e {
            Effect::ScheduleShutdown { session: 1, token } => Some(*token),
            _ => None,
        })
        .expect("shutdown scheduled");

    join(&mut hub, 1000);
    hub.shutdown_timer_fired(1, token);
    assert_eq!(hub.registry().len(), 1);
    assert!(state(&spawner, 0).lock().unwrap().terminated_with.is_none());
}

#[test]
fn deferred_shutdown_destroys_and_exits() {
    let (mut hub, spawner) = new_hub(options());
    let a = connect(&mut hub);
    hub.drain_effects();
    hub.viewer_closed(a);
    let token = match hub.drain_effects().as_slice() {
        [.., Effect::ScheduleShutdown { token, .. }] => *token,
        other => panic!("unexpected effects: {other:?}"),
    };

    hub.shutdown_timer_fired(1, token + 1);
    assert_eq!(hub.registry().len(), 1);

    hub.shutdown_timer_fired(1, token);
    assert!(hub.registry().is_empty());
    let effects = hub.drain_effects();
    assert!(effects.contains(&Effect::StopPump(1)));
    assert!(effects.contains(&Effect::Exit));
    assert_eq!(
        state(&spawner, 0).lock().unwrap().terminated_with,
        Some(libc::SIGHUP)
    );
}

#[test]
fn replay_round_trip() {
    let (mut hub, _spawner) = new_hub(options());
    let a = connect(&mut hub);
    flush(&mut hub, a);

    hub.viewer_input(a, b"\x92DETACH 1\n");
    let frame = flush(&mut hub, a);
    assert!(contains(&frame, b"\x13\x17\x1b[81u\x14"));
    assert!(session(&hub, 1).replay.is_active());
    assert_eq!(session(&hub, 1).replay.anchor(), 0);

    hub.pty_output(1, b"hello world");
    flush(&mut hub, a);
    assert_eq!(hub.viewer(a).unwrap().sent, 11);

    hub.viewer_input(a, b"\x92WINDOW-CONTENTS 6,<snap>\n");
    assert_eq!(session(&hub, 1).replay.window(), b"world");
    assert_eq!(hub.viewer(a).unwrap().contents, ContentsRequest::Idle);

    hub.viewer_closed(a);
    let b = join(&mut hub, 1000);
    let frame = flush(&mut hub, b);
    assert!(frame.starts_with(b"\x13\x16\x1b]31;1000\x07"));
    assert!(contains(&frame, b"\x13\x16\x1b]103;6,<snap>\x07\x14"));
    assert!(contains(&frame, b"\x1b[97uworld\x1b[98u"));
    assert!(contains(&frame, b"\x13\x17\x1b[96;11u\x14"));
    assert!(contains(&frame, b"\x1b[82;2u"));

    let viewer = hub.viewer(b).unwrap();
    assert_eq!((viewer.sent, viewer.confirmed), (11, 11));
    // B does not preserve the session, so the snapshot is not kept.
    assert!(session(&hub, 1).replay.snapshot().is_none());
}

#[test]
fn stale_window_contents_are_ignored() {
    let (mut hub, _spawner) = new_hub(options());
    let a = connect(&mut hub);
    hub.pty_output(1, &vec![b'z'; 500]);
    flush(&mut hub, a);
    hub.viewer_input(a, b"\x92DETACH 1\n");
    flush(&mut hub, a);
    assert_eq!(session(&hub, 1).replay.anchor(), 500);

    hub.viewer_input(a, b"\x92WINDOW-CONTENTS 100,old\n");
    assert!(session(&hub, 1).replay.snapshot().is_none());
    assert_eq!(hub.viewer(a).unwrap().contents, ContentsRequest::AwaitingReply);
}

#[test]
fn new_viewer_waits_for_pending_snapshot() {
    let (mut hub, _spawner) = new_hub(options());
    let a = connect(&mut hub);
    flush(&mut hub, a);
    hub.viewer_input(a, b"\x92DETACH 1\n");
    flush(&mut hub, a);

    let b = join(&mut hub, 1000);
    hub.pty_output(1, b"hello");
    let early = flush(&mut hub, b);
    assert!(!contains(&early, b"\x1b]31;"));
    assert!(!contains(&early, b"hello"));
    assert!(!hub.viewer(b).unwrap().initialized);
    hub.drain_effects();

    hub.viewer_input(a, b"\x92WINDOW-CONTENTS 0,S\n");
    assert!(hub.drain_effects().contains(&Effect::Writable(b)));
    let frame = flush(&mut hub, b);
    assert!(contains(&frame, b"\x1b]31;1000\x07"));
    assert!(contains(&frame, b"\x1b]103;0,S\x07"));
    assert!(contains(&frame, b"\x1b[97uhello\x1b[98u"));
    assert_eq!(frame.windows(5).filter(|w| w == b"hello").count(), 1);
    let viewer = hub.viewer(b).unwrap();
    assert!(viewer.initialized);
    assert_eq!((viewer.sent, viewer.confirmed), (5, 5));
    assert!(!contains(&flush(&mut hub, b), b"hello"));
}

#[test]
fn abandoned_contents_request_releases_waiting_viewer() {
    let (mut hub, _spawner) = new_hub(options());
    let a = connect(&mut hub);
    flush(&mut hub, a);
    hub.viewer_input(a, b"\x92DETACH 1\n");
    flush(&mut hub, a);

    let b = join(&mut hub, 1000);
    hub.pty_output(1, b"hi");
    assert!(!contains(&flush(&mut hub, b), b"hi"));

    hub.viewer_closed(a);
    assert!(!session(&hub, 1).replay.is_active());
    assert!(hub.drain_effects().contains(&Effect::Writable(b)));
    let frame = flush(&mut hub, b);
    assert!(contains(&frame, b"\x1b]31;1000\x07"));
    assert!(contains(&frame, b"hi"));
    assert_eq!(hub.viewer(b).unwrap().sent, 2);
}

#[test]
fn output_read_while_unattached_goes_to_next_viewer() {
    let (mut hub, _spawner) = new_hub(options());
    let a = connect(&mut hub);
    hub.viewer_input(a, b"\x92DETACH 1\n");
    hub.viewer_closed(a);
    assert!(session(&hub, 1).read_in_flight);

    hub.pty_output(1, b"late");
    assert!(read_grants(&hub.drain_effects()).is_empty());
    assert_eq!(session(&hub, 1).unclaimed, b"late");

    let b = join(&mut hub, 1000);
    assert!(contains(&flush(&mut hub, b), b"late"));
    assert_eq!(hub.viewer(b).unwrap().sent, 4);
    assert!(session(&hub, 1).unclaimed.is_empty());
}

#[test]
fn exited_unattached_session_is_reaped() {
    let (mut hub, spawner) = new_hub(options());
    let a = connect(&mut hub);
    hub.viewer_input(a, b"\x92DETACH 1\n");
    hub.viewer_closed(a);
    hub.pty_output(1, b"bye");
    hub.drain_effects();

    hub.reap_exited();
    assert_eq!(hub.registry().len(), 1);

    state(&spawner, 0).lock().unwrap().exited = Some(0);
    hub.reap_exited();
    assert!(hub.registry().is_empty());
    let effects = hub.drain_effects();
    assert!(effects.contains(&Effect::StopPump(1)));
    assert!(effects.contains(&Effect::Exit));
    assert!(state(&spawner, 0).lock().unwrap().terminated_with.is_none());
}

#[test]
fn attached_session_is_left_to_its_reader() {
    let (mut hub, spawner) = new_hub(options());
    connect(&mut hub);
    state(&spawner, 0).lock().unwrap().exited = Some(1);
    hub.reap_exited();
    assert_eq!(hub.registry().len(), 1);
}

#[test]
fn attach_by_specifier_requests_snapshot() {
    let (mut hub, _spawner) = new_hub(options());
    let a = connect(&mut hub);
    hub.viewer_input(a, b"\x92SESSION-NAME \"work\"\n");
    flush(&mut hub, a);

    let b = hub.viewer_connected(None).unwrap();
    assert_eq!(hub.attach_viewer(b, "work").unwrap(), 1);
    assert_eq!(hub.viewer(b).unwrap().session, Some(1));
    assert_eq!(hub.viewer(a).unwrap().contents, ContentsRequest::Requested);
    assert_eq!(session(&hub, 1).viewers, vec![a, b]);

    let c = hub.viewer_connected(None).unwrap();
    assert!(matches!(
        hub.attach_viewer(c, "play"),
        Err(HubError::SessionNotFound(_))
    ));
    assert_eq!(hub.viewer(c).unwrap().session, None);
}

#[test]
fn detached_start_waits_for_a_viewer() {
    let (mut hub, _spawner) = new_hub(options());
    assert_eq!(hub.spawn_detached().unwrap(), 1);
    assert!(session(&hub, 1).detached);
    let effects = hub.drain_effects();
    assert!(effects.contains(&Effect::StartPump(1)));
    assert!(read_grants(&effects).is_empty());
    assert!(!effects.contains(&Effect::Exit));

    let a = join(&mut hub, 1000);
    assert_eq!(hub.viewer(a).unwrap().session, Some(1));
    assert!(!session(&hub, 1).detached);
}

#[test]
fn session_names_and_uniqueness() {
    let (mut hub, _spawner) = new_hub(options());
    let a = connect(&mut hub);
    let b = connect(&mut hub);
    assert_eq!(hub.viewer(b).unwrap().session, Some(2));
    flush(&mut hub, a);
    flush(&mut hub, b);

    hub.viewer_input(a, b"\x92SESSION-NAME \"x\"\n");
    assert!(session(&hub, 1).name_unique);

    hub.drain_effects();
    hub.viewer_input(b, b"\x92SESSION-NAME \"x\"\n");
    assert!(!session(&hub, 1).name_unique);
    assert!(!session(&hub, 2).name_unique);
    let effects = hub.drain_effects();
    assert!(effects.contains(&Effect::Writable(a)));
    assert!(effects.contains(&Effect::Writable(b)));
    assert!(contains(&flush(&mut hub, a), b"\x1b[91;1;0;0u"));
    assert!(hub.registry().resolve("x").is_err());
    assert_eq!(hub.registry().resolve("1001"), Ok(Some(2)));

    hub.viewer_input(b, b"\x92SESSION-NAME \"y\"\n");
    assert!(session(&hub, 1).name_unique);
    assert!(session(&hub, 2).name_unique);
    assert!(contains(&flush(&mut hub, a), b"\x1b[91;1;1;0u"));
}

#[test]
fn canonical_mode_echoes_keys() {
    let (mut hub, spawner) = new_hub(options());
    let a = connect(&mut hub);
    flush(&mut hub, a);
    let st = state(&spawner, 0);
    st.lock().unwrap().modes = LocalModes {
        icanon: true,
        echo: true,
        ..LocalModes::default()
    };

    hub.viewer_input(a, b"\x92KEY 65\t97\t\"a\"\n");
    assert!(st.lock().unwrap().input.is_empty());
    assert!(contains(
        &flush(&mut hub, a),
        b"\x13\x16\x1b]74;65\t97\t\"a\"\x07\x14"
    ));

    hub.viewer_input(a, b"\x92KEY 67\t3\t\"\\u0003\"\n");
    assert_eq!(st.lock().unwrap().input, vec![3]);

    st.lock().unwrap().modes.icanon = false;
    hub.viewer_input(a, b"\x92KEY 66\t98\t\"b\"\n");
    assert_eq!(st.lock().unwrap().input, vec![3, b'b']);
}

#[test]
fn interrupt_while_paused_drains_queued_output() {
    let (mut hub, spawner) = new_hub(options());
    let a = connect(&mut hub);
    flush(&mut hub, a);
    let st = state(&spawner, 0);
    st.lock().unwrap().queued = 500;

    hub.drain_effects();
    hub.viewer_input(a, b"\x92KEY 67\t3\t\"\\u0003\"\n");
    assert!(!hub
        .drain_effects()
        .iter()
        .any(|e| matches!(e, Effect::DiscardPty { .. })));

    let chunk = vec![b'x'; READ_CHUNK];
    hub.pty_output(1, &chunk);
    hub.pty_output(1, &chunk);
    assert!(session(&hub, 1).paused);
    hub.drain_effects();

    hub.viewer_input(a, b"\x92KEY 67\t3\t\"\\u0003\"\n");
    assert!(hub
        .drain_effects()
        .contains(&Effect::DiscardPty { session: 1, len: 500 }));
    assert_eq!(st.lock().unwrap().input, vec![3, 3]);
}

#[test]
fn literal_input_reaches_the_pty() {
    let (mut hub, spawner) = new_hub(options());
    let a = connect(&mut hub);
    hub.viewer_input(a, b"ls -l\r\x92FOCUSED\nexit\r");
    assert_eq!(state(&spawner, 0).lock().unwrap().input, b"ls -l\rexit\r");
    assert_eq!(hub.focused, Some(a));
    assert_eq!(session(&hub, 1).recent_viewer, Some(a));
}

#[test]
fn readonly_drops_input_and_keys() {
    let (mut hub, spawner) = new_hub(HubOptions {
        readonly: true,
        ..options()
    });
    let a = connect(&mut hub);
    hub.viewer_input(a, b"rm -rf /\r");
    hub.viewer_input(a, b"\x92KEY 67\t3\t\"\\u0003\"\n");
    assert!(state(&spawner, 0).lock().unwrap().input.is_empty());

    hub.pty_output(1, b"abc");
    flush(&mut hub, a);
    hub.viewer_input(a, b"\x92RECEIVED 3\n");
    assert_eq!(hub.viewer(a).unwrap().confirmed, 3);
}

#[test]
fn once_refuses_a_second_viewer() {
    let (mut hub, _spawner) = new_hub(HubOptions {
        once: true,
        ..options()
    });
    let a = hub.viewer_connected(None).unwrap();
    assert!(hub.viewer_connected(None).is_none());
    hub.viewer_closed(a);
    assert!(hub.viewer_connected(None).is_some());
}

#[test]
fn window_size_resizes_pty() {
    let (mut hub, spawner) = new_hub(options());
    let a = connect(&mut hub);
    hub.viewer_input(a, b"\x92WS 30 100 600 1000\n");
    hub.viewer_input(a, b"\x92WS -1 100 0 0\n");

    let expected = Geometry {
        rows: Some(30),
        cols: Some(100),
        pixel_height: Some(600),
        pixel_width: Some(1000),
    };
    assert_eq!(state(&spawner, 0).lock().unwrap().resizes, vec![expected]);
    assert_eq!(session(&hub, 1).geometry.rows, None);
}

#[test]
fn malformed_events_change_nothing() {
    let (mut hub, spawner) = new_hub(options());
    let a = connect(&mut hub);
    hub.viewer_input(a, b"\x92RECEIVED lots\n\x92WS 1\n\x92KEY nope\n");
    assert_eq!(hub.viewer(a).unwrap().confirmed, 0);
    let st = state(&spawner, 0);
    let st = st.lock().unwrap();
    assert!(st.resizes.is_empty());
    assert!(st.input.is_empty());
}

#[test]
fn packet_mode_status_bytes() {
    let spawner = FakeSpawner {
        packet_mode: true,
        ..FakeSpawner::default()
    };
    let mut hub = Hub::new(options(), Box::new(spawner.clone()), None);
    let a = connect(&mut hub);
    flush(&mut hub, a);
    spawner.state(0).lock().unwrap().modes = LocalModes {
        icanon: true,
        echo: false,
        extproc: false,
        lflag: 0x8a3b,
    };

    hub.pty_output(1, b"\x00hi");
    assert_eq!(hub.viewer(a).unwrap().pending_payload, 2);
    hub.pty_output(1, &[TIOCPKT_IOCTL]);
    hub.pty_output(1, &[0x01]);

    assert_eq!(
        flush(&mut hub, a),
        b"hi\x13\x16\x1b]71; icanon -echo lflag:8a3b\x07\x14"
    );
    assert_eq!(hub.viewer(a).unwrap().sent, 2);
}

#[test]
fn echo_urgent_reaches_every_viewer() {
    let (mut hub, _spawner) = new_hub(options());
    let a = connect(&mut hub);
    let b = join(&mut hub, 1000);
    flush(&mut hub, a);
    flush(&mut hub, b);

    hub.viewer_input(b, b"\x92ECHO-URGENT \"note\"\n");
    assert_eq!(flush(&mut hub, a), b"\x13\x16note\x14");
    assert_eq!(flush(&mut hub, b), b"\x13\x16note\x14");
    assert_eq!(hub.viewer(a).unwrap().sent, 0);
}

#[test]
fn launcher_requests_become_effects() {
    let (mut hub, _spawner) = new_hub(options());
    let a = connect(&mut hub);
    hub.drain_effects();
    hub.viewer_input(a, b"\x92LINK {\"href\":\"https://example.org\"}\n");
    hub.viewer_input(a, b"\x92OPEN-WINDOW connect-pid=1000&geometry=80x24\n");
    let effects = hub.drain_effects();
    assert!(effects.contains(&Effect::OpenLink(
        serde_json::json!({"href": "https://example.org"})
    )));
    assert!(effects.contains(&Effect::OpenWindow {
        request: "connect-pid=1000&geometry=80x24".into(),
        geometry: Some("80x24".into()),
    }));
}

#[test]
fn pty_close_ends_the_stream() {
    let (mut hub, _spawner) = new_hub(options());
    let a = connect(&mut hub);
    flush(&mut hub, a);
    hub.pty_output(1, b"bye");
    hub.drain_effects();

    hub.pty_closed(1);
    let effects = hub.drain_effects();
    assert!(effects.contains(&Effect::StopPump(1)));
    assert!(effects.contains(&Effect::Writable(a)));
    assert!(!effects.contains(&Effect::Exit));
    assert_eq!(hub.viewer(a).unwrap().session, None);

    assert_eq!(flush(&mut hub, a), b"bye\x13\x16\x1b[99;99u\x14");
    assert!(hub.viewer_writable(a).is_none());

    hub.viewer_closed(a);
    assert!(hub.drain_effects().contains(&Effect::Exit));
}

#[test]
fn departing_viewer_leaves_no_references() {
    let (mut hub, _spawner) = new_hub(options());
    let a = connect(&mut hub);
    let b = join(&mut hub, 1000);
    hub.viewer_input(a, b"\x92FOCUSED\n");
    hub.viewer_input(a, b"pwd\r");
    assert_eq!(hub.focused, Some(a));
    assert_eq!(session(&hub, 1).recent_viewer, Some(a));

    hub.viewer_closed(a);
    assert_eq!(hub.focused, None);
    assert_eq!(session(&hub, 1).recent_viewer, None);
    assert_eq!(session(&hub, 1).viewers, vec![b]);
}

#[test]
fn prepare_attach_requests_contents_once() {
    let (mut hub, _spawner) = new_hub(options());
    let a = connect(&mut hub);
    let b = join(&mut hub, 1000);
    hub.viewer_input(a, b"\x92SESSION-NAME \"work\"\n");

    assert_eq!(hub.prepare_attach("work").unwrap(), 1);
    assert_eq!(hub.viewer(a).unwrap().contents, ContentsRequest::Requested);
    assert_eq!(hub.prepare_attach(":1").unwrap(), 1);
    assert_eq!(hub.viewer(b).unwrap().contents, ContentsRequest::Idle);

    assert!(matches!(
        hub.prepare_attach("play"),
        Err(HubError::SessionNotFound(_))
    ));
}

#[test]
fn explicit_detach_resets_policy_on_reattach() {
    let (mut hub, _spawner) = new_hub(options());
    let a = connect(&mut hub);
    hub.viewer_input(a, b"\x92DETACH 1\n");
    hub.viewer_closed(a);
    hub.mark_detached(1).unwrap();
    assert!(session(&hub, 1).detach_on_close);

    join(&mut hub, 1000);
    assert!(!session(&hub, 1).detached);
    assert!(!session(&hub, 1).detach_on_close);
    assert!(hub.mark_detached(9).is_err());
}

#[test]
fn settings_upload_and_reload() {
    let mut hub = Hub::new(
        options(),
        Box::new(FakeSpawner::default()),
        Some(r#"{"a":1}"#.into()),
    );
    let a = connect(&mut hub);
    assert!(contains(
        &flush(&mut hub, a),
        b"\x13\x16\x1b]89;{\"a\":1}\x07\x14"
    ));
    assert!(!contains(&flush(&mut hub, a), b"\x1b]89;"));

    hub.drain_effects();
    hub.set_settings(Some("{}".into()));
    assert!(hub.drain_effects().contains(&Effect::Writable(a)));
    assert!(contains(&flush(&mut hub, a), b"\x1b]89;{}\x07"));
}

#[test]
fn shutdown_terminates_every_session() {
    let (mut hub, spawner) = new_hub(options());
    let a = connect(&mut hub);
    connect(&mut hub);
    hub.shutdown();
    assert!(hub.registry().is_empty());
    assert_eq!(hub.viewer(a).unwrap().session, None);
    for index in 0..2 {
        assert_eq!(
            state(&spawner, index).lock().unwrap().terminated_with,
            Some(libc::SIGHUP)
        );
    }
}
