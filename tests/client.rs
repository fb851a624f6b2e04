use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

use gearman_client::proto::{Command, Packet};
use gearman_client::{Callbacks, Client, ClientOptions, Error, TaskState};

mod mock;
use mock::{ConnPlan, MockServer, Reply};

fn created(handle: &str) -> Packet {
    Packet::response(Command::JobCreated, vec![handle.as_bytes().to_vec()]).unwrap()
}

fn complete(handle: &str, data: &[u8]) -> Packet {
    Packet::response(
        Command::WorkComplete,
        vec![handle.as_bytes().to_vec(), data.to_vec()],
    )
    .unwrap()
}

fn exception(handle: &str, message: &[u8]) -> Packet {
    Packet::response(
        Command::WorkException,
        vec![handle.as_bytes().to_vec(), message.to_vec()],
    )
    .unwrap()
}

fn connected_client(server: &MockServer) -> Client {
    let mut client = Client::new();
    client.add_server(&server.url()).unwrap();
    client
}

#[test]
fn single_foreground_submit() {
    let server = MockServer::serve(|_, p| match p.command {
        Command::SubmitJob => {
            let reversed: Vec<u8> = p.args[2].iter().rev().copied().collect();
            Reply::Frames(vec![created("H:mock:1"), complete("H:mock:1", &reversed)])
        }
        _ => Reply::None,
    });

    let mut client = connected_client(&server);
    let result = Rc::new(RefCell::new(Vec::new()));
    let sink = Rc::clone(&result);
    let th = client
        .add_task(
            "rev",
            None,
            Some(&b"hello"[..]),
            Callbacks::new().on_complete(move |t| {
                sink.borrow_mut().extend_from_slice(t.result());
                Ok(())
            }),
        )
        .unwrap();

    client.run_tasks().unwrap();

    let task = client.task(th).unwrap();
    assert_eq!(task.state(), TaskState::Complete);
    assert_eq!(task.result(), b"olleh");
    assert_eq!(task.job_handle(), b"H:mock:1");
    assert_eq!(&*result.borrow(), b"olleh");
    assert_eq!(client.running_tasks(), 0);
}

#[test]
fn background_batch() {
    use rand::Rng;

    let server = MockServer::serve({
        let mut next = 0;
        move |_, p| match p.command {
            Command::SubmitJobBg => {
                next += 1;
                Reply::Frames(vec![created(&format!("H:mock:{}", next))])
            }
            _ => Reply::None,
        }
    });

    let mut client = connected_client(&server);
    let mut rng = rand::thread_rng();
    let mut handles = Vec::new();
    for _ in 0..20 {
        let size = rng.gen_range(1024..=2048);
        let workload: Vec<u8> = (0..size).map(|_| rng.gen::<u8>()).collect();
        handles.push(
            client.add_task_background("burnin", None, Some(&workload), ()).unwrap(),
        );
    }
    assert_eq!(client.new_tasks(), 20);

    client.run_tasks().unwrap();

    assert_eq!(client.new_tasks(), 0);
    assert_eq!(client.running_tasks(), 0);
    for th in handles {
        let task = client.task(th).unwrap();
        assert_eq!(task.state(), TaskState::Created);
        assert!(!task.job_handle().is_empty());
    }
}

#[test]
fn mid_stream_disconnect_requeues_unsent_tasks() {
    // The first accepted connection reads nothing and hangs up, so the
    // jumbo head-of-queue frame is still mid-write when the transport
    // dies; the later frames never left the queue and must be retried on
    // the reconnect.
    let server = MockServer::start(
        |conn| match conn {
            1 => ConnPlan::SilenceThenClose(Duration::from_millis(300)),
            _ => ConnPlan::Serve,
        },
        {
            let mut next = 0;
            move |_, p| match p.command {
                Command::SubmitJob => {
                    next += 1;
                    let handle = format!("H:retry:{}", next);
                    Reply::Frames(vec![created(&handle), complete(&handle, b"ok")])
                }
                _ => Reply::None,
            }
        },
    );

    let mut client = connected_client(&server);
    // Large enough that no socket buffer swallows it whole.
    let jumbo = vec![0x5a_u8; 32 * 1024 * 1024];
    let stuck = client.add_task("rev", None, Some(&jumbo), ()).unwrap();
    let mut retried = Vec::new();
    for i in 0..4 {
        let workload = format!("payload-{}", i);
        retried.push(
            client.add_task("rev", None, Some(workload.as_bytes()), ()).unwrap(),
        );
    }

    client.run_tasks().unwrap();

    let lost = client.task(stuck).unwrap();
    assert_eq!(lost.state(), TaskState::Failed);
    assert!(matches!(lost.error(), Some(Error::LostConnection { .. })));

    for th in retried {
        let task = client.task(th).unwrap();
        assert_eq!(task.state(), TaskState::Complete, "requeued task should complete");
        assert_eq!(task.result(), b"ok");
    }

    // Everything that completed did so over the second connection.
    assert!(server.received().iter().all(|(conn, _)| *conn == 2));
}

#[test]
fn namespace_prefixes_function_on_the_wire() {
    let server = MockServer::serve(|_, p| match p.command {
        Command::SubmitJobBg => Reply::Frames(vec![created("H:ns:1")]),
        _ => Reply::None,
    });

    let mut client = connected_client(&server);
    client.set_namespace("X-");
    let th = client.add_task_background("f", None, Some(&b"w"[..]), ()).unwrap();
    client.run_tasks().unwrap();

    // Callbacks and accessors see the un-prefixed name.
    assert_eq!(client.task(th).unwrap().function(), b"f");

    let received = server.received();
    let (_, submit) = &received[0];
    assert_eq!(submit.command, Command::SubmitJobBg);
    assert_eq!(submit.args[0], b"X-f");
    // First wire argument is the prefixed name followed by the separator.
    let raw = server.raw_bytes();
    let payload = &raw[gearman_client::proto::HEADER_LEN..];
    assert!(payload.starts_with(b"X-f\0"));
}

#[test]
fn exception_routing_with_and_without_handshake() {
    // Negotiated: WORK_EXCEPTION is terminal and hits the exception
    // callback.
    let server = MockServer::serve(|_, p| match p.command {
        Command::OptionReq => {
            Reply::Frames(vec![
                Packet::response(Command::OptionRes, vec![p.args[0].clone()]).unwrap()
            ])
        }
        Command::SubmitJob => {
            Reply::Frames(vec![created("H:exc:1"), exception("H:exc:1", b"boom")])
        }
        _ => Reply::None,
    });

    let mut client = connected_client(&server);
    client.set_server_option("exceptions").unwrap();
    assert!(client.exceptions_negotiated());

    let message = Rc::new(RefCell::new(Vec::new()));
    let sink = Rc::clone(&message);
    let th = client
        .add_task(
            "explode",
            None,
            Some(&b"w"[..]),
            Callbacks::new().on_exception(move |_, msg| {
                sink.borrow_mut().extend_from_slice(msg);
                Ok(())
            }),
        )
        .unwrap();
    client.run_tasks().unwrap();

    let task = client.task(th).unwrap();
    assert_eq!(task.state(), TaskState::Exception);
    assert_eq!(task.exception(), b"boom");
    assert_eq!(&*message.borrow(), b"boom");

    // Not negotiated: the same packet is just data and the task runs on.
    let server = MockServer::serve(|_, p| match p.command {
        Command::SubmitJob => Reply::Frames(vec![
            created("H:exc:2"),
            exception("H:exc:2", b"boom"),
            complete("H:exc:2", b"-done"),
        ]),
        _ => Reply::None,
    });

    let mut client = connected_client(&server);
    let chunks = Rc::new(RefCell::new(Vec::new()));
    let sink = Rc::clone(&chunks);
    let th = client
        .add_task(
            "explode",
            None,
            Some(&b"w"[..]),
            Callbacks::new().on_data(move |_, chunk| {
                sink.borrow_mut().push(chunk.to_vec());
                Ok(())
            }),
        )
        .unwrap();
    client.run_tasks().unwrap();

    let task = client.task(th).unwrap();
    assert_eq!(task.state(), TaskState::Complete);
    assert_eq!(task.result(), b"boom-done");
    assert_eq!(&*chunks.borrow(), &[b"boom".to_vec()]);
}

#[test]
fn epoch_submit_encodes_decimal_time() {
    let server = MockServer::serve(|_, p| match p.command {
        Command::SubmitJobEpoch => Reply::Frames(vec![created("H:epoch:1")]),
        _ => Reply::None,
    });

    let mut client = connected_client(&server);
    let th = client
        .add_task_epoch("later", Some(b"u-1"), Some(&b"w"[..]), 2_000_000_000, ())
        .unwrap();
    client.run_tasks().unwrap();

    assert_eq!(client.task(th).unwrap().state(), TaskState::Created);
    let received = server.received();
    let (_, submit) = &received[0];
    assert_eq!(submit.args[2], b"2000000000");
    let raw = server.raw_bytes();
    assert!(raw
        .windows(b"\x002000000000\x00".len())
        .any(|w| w == b"\x002000000000\x00"));
}

#[test]
fn echo_round_trip() {
    let server = MockServer::serve(|_, p| match p.command {
        Command::EchoReq => Reply::Frames(vec![
            Packet::response(Command::EchoRes, vec![p.args[0].clone()]).unwrap()
        ]),
        _ => Reply::None,
    });

    let mut client = connected_client(&server);
    client.echo(b"echo_test").unwrap();
    assert_eq!(client.task_count(), 0, "echo cleans up its internal task");
}

#[test]
fn status_task_reports_progress() {
    let server = MockServer::serve(|_, p| match p.command {
        Command::GetStatus => Reply::Frames(vec![Packet::response(
            Command::StatusRes,
            vec![
                p.args[0].clone(),
                b"1".to_vec(),
                b"1".to_vec(),
                b"55".to_vec(),
                b"100".to_vec(),
            ],
        )
        .unwrap()]),
        _ => Reply::None,
    });

    let mut client = connected_client(&server);
    let seen = Rc::new(RefCell::new((0_u32, 0_u32)));
    let sink = Rc::clone(&seen);
    let th = client
        .add_task_status(
            "H:bg:42",
            Callbacks::new().on_status(move |t| {
                *sink.borrow_mut() = (t.numerator(), t.denominator());
                Ok(())
            }),
        )
        .unwrap();
    client.run_tasks().unwrap();

    let task = client.task(th).unwrap();
    assert_eq!(task.state(), TaskState::Complete);
    assert!(task.known());
    assert!(task.running());
    assert_eq!(*seen.borrow(), (55, 100));
}

#[test]
fn server_error_fails_the_responsible_task() {
    let server = MockServer::serve(|_, p| match p.command {
        Command::SubmitJob => Reply::FramesThenClose(vec![Packet::response(
            Command::Error,
            vec![b"ERR_QUEUE_FULL".to_vec(), b"queue is full".to_vec()],
        )
        .unwrap()]),
        _ => Reply::None,
    });

    let mut client = connected_client(&server);
    let failed = Rc::new(RefCell::new(false));
    let sink = Rc::clone(&failed);
    let th = client
        .add_task(
            "f",
            None,
            Some(&b"w"[..]),
            Callbacks::new().on_fail(move |_| {
                *sink.borrow_mut() = true;
                Ok(())
            }),
        )
        .unwrap();
    client.run_tasks().unwrap();

    let task = client.task(th).unwrap();
    assert_eq!(task.state(), TaskState::Failed);
    match task.error() {
        Some(Error::Server { code, text }) => {
            assert_eq!(code, "ERR_QUEUE_FULL");
            assert_eq!(text, "queue is full");
        }
        other => panic!("expected server error, got {:?}", other),
    }
    assert!(*failed.borrow());
}

#[test]
fn non_blocking_run_returns_io_wait() {
    let server = MockServer::serve(|_, _| Reply::None);

    let mut client = connected_client(&server);
    client.set_non_blocking(true);
    let th = client.add_task("f", None, Some(&b"w"[..]), ()).unwrap();

    match client.run_tasks() {
        Err(Error::IoWait) => {}
        other => panic!("expected IoWait, got {:?}", other.map(|_| ())),
    }
    // The request was flushed; the task is just waiting on the server.
    assert_eq!(client.task(th).unwrap().state(), TaskState::WaitJobCreated);
}

#[test]
fn blocking_run_honors_timeout() {
    let server = MockServer::serve(|_, _| Reply::None);

    let mut client = connected_client(&server);
    client.set_timeout(Some(Duration::from_millis(100)));
    client.add_task("f", None, Some(&b"w"[..]), ()).unwrap();

    match client.run_tasks() {
        Err(Error::Timeout) => {}
        other => panic!("expected Timeout, got {:?}", other.map(|_| ())),
    }
}

#[test]
fn tasks_round_robin_across_servers() {
    let respond = || {
        let mut next = 0;
        move |_: usize, p: &Packet| match p.command {
            Command::SubmitJobBg => {
                next += 1;
                Reply::Frames(vec![created(&format!("H:rr:{}", next))])
            }
            _ => Reply::None,
        }
    };
    let a = MockServer::serve(respond());
    let b = MockServer::serve(respond());

    let mut client = Client::new();
    client.add_servers([a.url().as_str(), b.url().as_str()]).unwrap();
    for i in 0..4 {
        let workload = format!("w{}", i);
        client.add_task_background("spread", None, Some(workload.as_bytes()), ()).unwrap();
    }
    client.run_tasks().unwrap();

    assert_eq!(a.received().len(), 2);
    assert_eq!(b.received().len(), 2);
}

#[test]
fn free_tasks_reclaims_terminal_tasks() {
    let server = MockServer::serve(|_, p| match p.command {
        Command::SubmitJobBg => Reply::Frames(vec![created("H:free:1")]),
        _ => Reply::None,
    });

    let mut client = connected_client(&server);
    client.set_options(ClientOptions { free_tasks: true, ..ClientOptions::default() });
    let th = client.add_task_background("f", None, Some(&b"w"[..]), ()).unwrap();
    client.run_tasks().unwrap();

    assert!(client.task(th).is_none());
    assert_eq!(client.task_count(), 0);
}

#[test]
fn callback_error_refuses_new_submissions() {
    let server = MockServer::serve(|_, p| match p.command {
        Command::SubmitJobBg => Reply::Frames(vec![created("H:cb:1")]),
        _ => Reply::None,
    });

    let mut client = connected_client(&server);
    client
        .add_task_background(
            "f",
            None,
            Some(&b"w"[..]),
            Callbacks::new().on_created(|_| {
                Err(Error::InvalidArgument { message: "handler rejected".into() })
            }),
        )
        .unwrap();
    client.run_tasks().unwrap();

    assert!(client.last_error().is_some());
    match client.add_task("f", None, Some(&b"w"[..]), ()) {
        Err(Error::Degraded { .. }) => {}
        other => panic!("expected degraded client, got {:?}", other.map(|_| ())),
    }
}

#[test]
fn client_wide_callbacks_observe_every_task() {
    use std::cell::Cell;

    let server = MockServer::serve({
        let mut next = 0;
        move |_, p| match p.command {
            Command::SubmitJobBg => {
                next += 1;
                Reply::Frames(vec![created(&format!("H:all:{}", next))])
            }
            _ => Reply::None,
        }
    });

    let mut client = connected_client(&server);
    let seen = Rc::new(Cell::new(0));
    let sink = Rc::clone(&seen);
    client.set_callbacks(Callbacks::new().on_created(move |_| {
        sink.set(sink.get() + 1);
        Ok(())
    }));

    client.add_task_background("a", None, Some(&b"w"[..]), ()).unwrap();
    client.add_task_background("b", None, Some(&b"w"[..]), ()).unwrap();
    client.run_tasks().unwrap();

    assert_eq!(seen.get(), 2);
}

#[test]
fn caller_unique_id_is_sent_verbatim() {
    let server = MockServer::serve(|_, p| match p.command {
        Command::SubmitJobBg => Reply::Frames(vec![created("H:u:1")]),
        _ => Reply::None,
    });

    let mut client = connected_client(&server);
    client
        .add_task_background("f", Some(b"order-123"), Some(&b"w"[..]), ())
        .unwrap();
    client.run_tasks().unwrap();

    let received = server.received();
    assert_eq!(received[0].1.args[1], b"order-123");
}

#[test]
fn generated_unique_id_is_canonical_uuid_on_the_wire() {
    let server = MockServer::serve(|_, p| match p.command {
        Command::SubmitJobBg => Reply::Frames(vec![created("H:u:2")]),
        _ => Reply::None,
    });

    let mut client = connected_client(&server);
    client.add_task_background("f", None, Some(&b"w"[..]), ()).unwrap();
    client.run_tasks().unwrap();

    let received = server.received();
    let unique = &received[0].1.args[1];
    assert_eq!(unique.len(), 36);
    let s = std::str::from_utf8(unique).unwrap();
    assert_eq!(
        s.match_indices('-').map(|(i, _)| i).collect::<Vec<_>>(),
        vec![8, 13, 18, 23]
    );
}
