//! Master election over the in-process ensemble

use hafleet::coordination::{CoordinationClient, MemoryEnsemble};
use hafleet::coordinator::{Contender, Leadership};
use std::sync::Arc;
use std::time::Duration;

const ELECTION: &str = "/hafleet/services/journal/logicalService0000000000/masterElection";

async fn wait_master(contenders: &[Contender]) -> usize {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let masters: Vec<usize> = contenders
            .iter()
            .enumerate()
            .filter(|(_, c)| c.leadership() == Leadership::Master)
            .map(|(i, _)| i)
            .collect();
        if masters.len() == 1 {
            return masters[0];
        }
        assert!(masters.len() <= 1, "two masters: {:?}", masters);
        assert!(tokio::time::Instant::now() < deadline, "no master elected");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

#[tokio::test]
async fn test_lowest_surviving_sequence_wins() {
    let ensemble = MemoryEnsemble::new();
    let sessions: Vec<Arc<dyn CoordinationClient>> = (0..5)
        .map(|_| Arc::new(ensemble.connect()) as Arc<dyn CoordinationClient>)
        .collect();

    // join in a scrambled order
    let mut contenders: Vec<(usize, Contender)> = Vec::new();
    for i in [3, 0, 4, 1, 2] {
        let contender = Contender::join(sessions[i].clone(), ELECTION, b"").unwrap();
        contenders.push((i, contender));
    }

    // drop masters one by one; the next-lowest sequence always takes over
    let mut live: Vec<Contender> = contenders.into_iter().map(|(_, c)| c).collect();
    while !live.is_empty() {
        let master = wait_master(&live).await;
        let lowest = live
            .iter()
            .enumerate()
            .min_by_key(|(_, c)| c.sequence())
            .map(|(i, _)| i)
            .unwrap();
        assert_eq!(master, lowest);
        live[master].ensure_master().unwrap();

        let resigned = live.remove(master);
        resigned.resign().unwrap();
    }
}
