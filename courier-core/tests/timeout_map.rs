use courier_core::{Clock, ManualClock, ScheduledExecutor, TimeoutMap, TimeoutMapEvent};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

fn manual_map(clock: &ManualClock) -> TimeoutMap<String, i64> {
    TimeoutMap::with_clock(Duration::from_millis(100), Arc::new(clock.clone()))
}

#[test]
fn test_get_refreshes_expiry() {
    let clock = ManualClock::starting_at(0);
    let map = manual_map(&clock);
    map.put("a".to_string(), 1, Duration::from_millis(1000));

    clock.advance(Duration::from_millis(900));
    assert_eq!(map.get(&"a".to_string()), Some(1));

    // 1600ms after the put, but only 700ms after the last access
    clock.advance(Duration::from_millis(700));
    assert_eq!(map.purge(), 0);
    assert!(map.contains_key(&"a".to_string()));

    clock.advance(Duration::from_millis(400));
    assert_eq!(map.purge(), 1);
    assert!(map.is_empty());
}

#[test]
fn test_evictions_reported_in_expiry_order() {
    let clock = ManualClock::starting_at(0);
    let map = manual_map(&clock);
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    map.add_listener(move |event: TimeoutMapEvent, key: &String, _: &i64| {
        if event == TimeoutMapEvent::Evict {
            sink.lock().push(key.clone());
        }
    });

    map.put("late".to_string(), 1, Duration::from_millis(300));
    map.put("early".to_string(), 2, Duration::from_millis(100));
    map.put("middle".to_string(), 3, Duration::from_millis(200));

    clock.advance(Duration::from_millis(500));
    assert_eq!(map.purge(), 3);
    assert_eq!(*seen.lock(), vec!["early", "middle", "late"]);
}

#[tokio::test(start_paused = true)]
async fn test_background_sweep_evicts() {
    let clock = ManualClock::starting_at(0);
    let map = manual_map(&clock);
    let executor = ScheduledExecutor::new("sweeper").unwrap();
    map.start(&executor).unwrap();

    map.put("k".to_string(), 7, Duration::from_millis(50));
    clock.advance(Duration::from_millis(60));

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert!(map.is_empty());

    map.stop();
    assert!(!map.is_started());
    executor.shutdown();
}
