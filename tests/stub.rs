use std::collections::HashMap;

use bytes::{Bytes, BytesMut};
use tokio::time::{Duration, Instant};

use respconn::{Command, ErrorKind, Reply, Stub};

/// A tiny key-value server: GET, SET and ECHO, everything else is rejected.
fn test_stub() -> Stub {
    let mut store: HashMap<String, Bytes> = HashMap::new();

    Stub::new(move |args| {
        let name = String::from_utf8_lossy(&args[0]).to_uppercase();
        match (name.as_str(), &args[1..]) {
            ("GET", [key]) => {
                let key = String::from_utf8_lossy(key).into_owned();
                Ok(store.get(&key).cloned().map_or(Reply::Nil, Reply::Bulk))
            }
            ("SET", [key, value]) => {
                let key = String::from_utf8_lossy(key).into_owned();
                store.insert(key, value.clone());
                Ok(Reply::Status("OK".to_string()))
            }
            ("ECHO", [value]) => Ok(Reply::Bulk(value.clone())),
            ("GET" | "SET" | "ECHO", _) => Err(format!(
                "ERR wrong number of arguments for '{}' command",
                name.to_lowercase()
            )
            .into()),
            _ => Err(format!("ERR unknown command '{}'", name).into()),
        }
    })
}

#[tokio::test]
async fn test_set_and_get() {
    let stub = test_stub();

    stub.encode(&Command::new("SET").arg("foo").arg("bar"))
        .unwrap();
    assert_eq!(stub.decode().await, Reply::Status("OK".to_string()));

    stub.encode(&Command::new("GET").arg("foo")).unwrap();
    assert_eq!(stub.decode().await.into_string().unwrap(), "bar");

    stub.encode(&Command::new("SET").arg("n").arg(42)).unwrap();
    stub.encode(&Command::new("GET").arg("n")).unwrap();
    assert_eq!(stub.decode().await, Reply::Status("OK".to_string()));
    assert_eq!(stub.decode().await.to_int().unwrap(), 42);

    stub.encode(&Command::new("GET").arg("missing")).unwrap();
    assert_eq!(stub.decode().await, Reply::Nil);
}

#[tokio::test]
async fn test_handler_errors_are_error_replies() {
    let stub = test_stub();

    stub.encode(&Command::new("GET")).unwrap();
    let reply = stub.decode().await;
    assert!(
        matches!(reply, Reply::Error(ref err) if err.kind() == ErrorKind::Server),
        "unexpected reply {:?}",
        reply
    );
    assert_eq!(
        reply.into_result().unwrap_err().message(),
        "ERR wrong number of arguments for 'get' command"
    );

    stub.encode(&Command::new("FLUSHALL")).unwrap();
    let err = stub.decode().await.into_result().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Server);
    assert_eq!(err.message(), "ERR unknown command 'FLUSHALL'");
}

#[tokio::test]
async fn test_loading_errors_are_classified() {
    let stub = Stub::new(|_| Err("LOADING Redis is loading the dataset in memory".into()));

    stub.encode(&Command::new("GET").arg("foo")).unwrap();
    let reply = stub.decode().await;

    assert!(matches!(reply, Reply::Error(ref err) if err.is_loading()));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_concurrent_writer_and_reader() {
    let stub = test_stub();
    let count = 1000;

    let writer = tokio::spawn({
        let stub = stub.clone();
        async move {
            for i in 0..count {
                stub.encode(&Command::new("ECHO").arg(i)).unwrap();
                if i % 100 == 0 {
                    tokio::task::yield_now().await;
                }
            }
        }
    });

    let reader = tokio::spawn({
        let stub = stub.clone();
        async move {
            let mut values = Vec::with_capacity(count);
            for _ in 0..count {
                values.push(stub.decode().await.to_int().unwrap());
            }
            values
        }
    });

    writer.await.unwrap();
    let values = reader.await.unwrap();

    assert_eq!(values, (0..count as i64).collect::<Vec<_>>());
}

#[tokio::test(start_paused = true)]
async fn test_deadline() {
    let stub = test_stub();
    let deadline = Instant::now() + Duration::from_secs(2);
    stub.set_deadline(Some(deadline));

    stub.encode(&Command::new("ECHO").arg("hello")).unwrap();
    assert_eq!(stub.decode().await, Reply::Bulk(Bytes::from("hello")));

    // Nothing more was written, so the next read waits until the deadline.
    let reply = stub.decode().await;
    assert!(
        matches!(reply, Reply::Error(ref err) if err.is_timeout()),
        "unexpected reply {:?}",
        reply
    );
    assert!(Instant::now() >= deadline);

    // The deadline has passed, but data that is already there is still returned.
    stub.encode(&Command::new("ECHO").arg("late")).unwrap();
    assert_eq!(stub.decode().await, Reply::Bulk(Bytes::from("late")));

    // A deadline passed to the read takes precedence over the stub's own.
    stub.set_deadline(None);
    let mut buf = BytesMut::new();
    let err = stub
        .read(&mut buf, Some(Instant::now() + Duration::from_millis(10)))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), std::io::ErrorKind::TimedOut);
}

#[tokio::test]
async fn test_reader_waits_for_writer() {
    let stub = test_stub();

    let reader = tokio::spawn({
        let stub = stub.clone();
        async move { stub.decode().await }
    });

    tokio::time::sleep(Duration::from_millis(10)).await;
    stub.encode(&Command::new("ECHO").arg("wake up")).unwrap();

    assert_eq!(reader.await.unwrap(), Reply::Bulk(Bytes::from("wake up")));
}
