use chrono::Duration;
use pretty_assertions::assert_eq;
use quota_bucket::{
    time::{Frequency, Time, TimeUnit},
    Bucket, InMemoryStorage, Response, Storage,
};

#[tokio::test]
async fn should_drain_whole_capacity_then_reject() {
    let storage = InMemoryStorage::new();
    let bucket = storage
        .create("drain", 5, Duration::minutes(1))
        .await
        .unwrap();
    let response = bucket.add(5).await.unwrap();
    assert_eq!(response.is_full(), false);
    assert_eq!(response.state().remaining, 0);
    let response = bucket.add(1).await.unwrap();
    assert_eq!(response.is_full(), true);
    assert_eq!(response.state(), &bucket.state());
}

#[tokio::test]
async fn should_return_same_bucket_for_same_name() {
    let storage = InMemoryStorage::new();
    let first = storage
        .create("shared", 10, Duration::minutes(1))
        .await
        .unwrap();
    first.add(3).await.unwrap();
    let second = storage
        .create("shared", 50, Duration::hours(1))
        .await
        .unwrap();
    assert_eq!(second.capacity(), 10);
    assert_eq!(second.remaining(), 7);
    assert_eq!(second.reset(), first.reset());
    second.add(2).await.unwrap();
    assert_eq!(first.remaining(), 5);
    assert_eq!(storage.len().unwrap(), 1);
}

#[tokio::test]
async fn should_refill_after_window() {
    let storage = InMemoryStorage::new();
    let bucket = storage
        .create("refill", 10, Duration::milliseconds(50))
        .await
        .unwrap();
    let first = bucket.add(10).await.unwrap();
    assert_eq!(bucket.add(1).await.unwrap().is_full(), true);
    tokio::time::sleep(std::time::Duration::from_millis(60)).await;
    match bucket.add(4).await.unwrap() {
        Response::Ok(state) => {
            assert_eq!(state.remaining, 6);
            assert!(state.reset > first.state().reset);
        }
        Response::Full(state) => panic!("expected a fresh window, got {:?}", state),
    }
}

#[tokio::test]
async fn should_create_from_frequency() {
    let storage = InMemoryStorage::new();
    let bucket = storage
        .create_with_frequency(
            "frequency",
            &Frequency::new(3, Time::new(2, TimeUnit::Minutes)),
        )
        .await
        .unwrap();
    assert_eq!(bucket.capacity(), 3);
    let existing = storage
        .bucket("frequency", 3, Duration::minutes(2))
        .unwrap();
    assert_eq!(existing.rate(), Duration::minutes(2));
    assert_eq!(storage.len().unwrap(), 1);
}

#[tokio::test]
async fn should_reject_frequency_beyond_calendar() {
    let storage = InMemoryStorage::new();
    let result = storage
        .create_with_frequency(
            "huge",
            &Frequency::new(1, Time::new(usize::MAX, TimeUnit::Days)),
        )
        .await;
    assert!(result.is_err());
    assert!(storage.is_empty().unwrap());
}

#[tokio::test]
async fn should_reject_empty_window() {
    let storage = InMemoryStorage::new();
    assert!(storage.create("empty", 1, Duration::zero()).await.is_err());
    assert!(storage.is_empty().unwrap());
}

#[tokio::test]
async fn should_share_bucket_across_tasks() {
    let storage = InMemoryStorage::new();
    let handles = (0..20)
        .map(|_| {
            let storage = storage.clone();
            tokio::spawn(async move {
                let bucket = storage
                    .create("tasks", 15, Duration::minutes(1))
                    .await
                    .unwrap();
                bucket.add(1).await.unwrap()
            })
        })
        .collect::<Vec<_>>();
    let responses = futures::future::join_all(handles).await;
    let accepted = responses
        .into_iter()
        .map(|response| response.unwrap())
        .filter(|response| !response.is_full())
        .count();
    assert_eq!(accepted, 15);
    let bucket = storage
        .create("tasks", 15, Duration::minutes(1))
        .await
        .unwrap();
    assert_eq!(bucket.remaining(), 0);
}
