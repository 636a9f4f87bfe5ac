use std::{collections::HashSet, sync::Arc};

use tokio::sync::{mpsc, Barrier, Mutex};

use crate::{
    protocol::message::{Bet, Message},
    storage::{BetStore, StoreError},
};

pub const DEFAULT_WINNING_NUMBER: u32 = 7574;

/// The channel an agency's connection listens on for messages sent by the server
pub type Responder = mpsc::Sender<Message>;

/// A bet wins when the number it was placed on is the winning number
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WinningNumber(pub u32);

impl WinningNumber {
    pub fn has_won(&self, bet: &Bet) -> bool {
        bet.number
            .trim()
            .parse::<u32>()
            .is_ok_and(|number| number == self.0)
    }
}

impl Default for WinningNumber {
    fn default() -> Self {
        Self(DEFAULT_WINNING_NUMBER)
    }
}

/// Agency identifiers are integers sent as text, "01" and "1" are the same agency
pub fn same_agency(lhs: &str, rhs: &str) -> bool {
    agency_key(lhs) == agency_key(rhs)
}

// the canonical form of an agency identifier
fn agency_key(agency: &str) -> String {
    let agency = agency.trim();
    match agency.parse::<u64>() {
        Ok(id) => id.to_string(),
        Err(_) => agency.to_owned(),
    }
}

#[derive(Debug)]
struct PendingQuery {
    agency: String,
    responder: Responder,
}

#[derive(Debug, Default)]
struct State {
    // keyed by the canonical agency identifier
    finished: HashSet<String>,
    // both flags only ever go from false to true
    lottery_completed: bool,
    winners_sent: bool,
    pending: Vec<PendingQuery>,
    winners: Vec<Bet>,
}

/// Coordinates a single lottery round between all the agencies
///
/// every agency goes through two rendezvous points:
/// - all agencies finished submitting bets, after which the lottery is run
/// - all agencies queried their winners, after which the winners are sent
///
/// both barriers are sized to the number of expected agencies, an agency
/// that never arrives keeps every other agency waiting.
pub struct Lottery {
    agencies: usize,
    store: Arc<dyn BetStore>,
    draw: WinningNumber,
    all_finished: Barrier,
    all_queried: Barrier,
    state: Mutex<State>,
}

impl Lottery {
    pub fn new(agencies: usize, store: Arc<dyn BetStore>, draw: WinningNumber) -> Self {
        Self {
            agencies,
            store,
            draw,
            all_finished: Barrier::new(agencies),
            all_queried: Barrier::new(agencies),
            state: Mutex::default(),
        }
    }

    pub fn agencies(&self) -> usize {
        self.agencies
    }

    pub async fn store_bets(&self, bets: &[Bet]) -> Result<(), StoreError> {
        self.store.append(bets).await
    }

    /// Records that the agency won't submit any more bets
    ///
    /// returns false if the agency was already marked as finished
    pub async fn mark_finished(&self, agency: &str) -> bool {
        let mut state = self.state.lock().await;
        let is_new = state.finished.insert(agency_key(agency));

        match is_new {
            true => tracing::info!(
                "agency {} finished, {}/{} agencies are done",
                agency,
                state.finished.len(),
                self.agencies
            ),
            false => tracing::info!(
                "agency {} had already finished, {}/{} agencies are done",
                agency,
                state.finished.len(),
                self.agencies
            ),
        }

        is_new
    }

    pub async fn finished_count(&self) -> usize {
        self.state.lock().await.finished.len()
    }

    pub async fn wait_all_finished(&self) {
        self.all_finished.wait().await;
    }

    pub async fn wait_all_queried(&self) {
        self.all_queried.wait().await;
    }

    /// Runs the lottery, unless somebody already did
    ///
    /// returns true for the single caller that actually ran it
    pub async fn run_lottery_once(&self) -> bool {
        {
            let mut state = self.state.lock().await;
            if state.lottery_completed {
                return false;
            }
            state.lottery_completed = true;
        }

        // the store is read without holding the lock
        let winners: Vec<Bet> = match self.store.load_all().await {
            Ok(bets) => bets
                .into_iter()
                .filter(|bet| self.draw.has_won(bet))
                .collect(),
            Err(reason) => {
                tracing::error!("failed to load the bets for the lottery: {}", reason);
                vec![]
            }
        };

        tracing::info!("lottery completed with {} winning bets", winners.len());
        self.state.lock().await.winners = winners;

        true
    }

    /// Queue the agency's query until every agency has asked for its winners
    pub async fn enqueue_query(&self, agency: String, responder: Responder) {
        let mut state = self.state.lock().await;
        state.pending.push(PendingQuery { agency, responder });
        tracing::debug!(
            "{}/{} agencies are waiting for their winners",
            state.pending.len(),
            self.agencies
        );
    }

    /// Sends every pending query its winners, unless somebody already did
    ///
    /// returns true for the single caller that actually sent them
    pub async fn broadcast_once(&self) -> bool {
        let pending = {
            let mut state = self.state.lock().await;
            if state.winners_sent {
                return false;
            }
            state.winners_sent = true;
            std::mem::take(&mut state.pending)
        };

        // the winners never change once the lottery ran
        for query in pending {
            let documents = self.winners_for(&query.agency).await;
            let count = documents.len();
            match query.responder.send(Message::Winners { documents }).await {
                Ok(()) => tracing::info!("sent {} winners to agency {}", count, query.agency),
                // the agency disconnected, nobody is left to tell
                Err(_) => tracing::warn!(
                    "agency {} disconnected before receiving its winners",
                    query.agency
                ),
            }
        }

        true
    }

    /// The documents of every winning bet placed at the given agency
    pub async fn winners_for(&self, agency: &str) -> Vec<String> {
        self.state
            .lock()
            .await
            .winners
            .iter()
            .filter(|bet| same_agency(&bet.agency, agency))
            .map(|bet| bet.document.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tokio::sync::mpsc;

    use super::{same_agency, Lottery, WinningNumber};
    use crate::{
        protocol::message::{tests::bet, Message},
        storage::memory::MemoryStore,
    };

    fn lottery(agencies: usize, store: Arc<MemoryStore>) -> Arc<Lottery> {
        Arc::new(Lottery::new(agencies, store, WinningNumber::default()))
    }

    #[test]
    fn check_winning_number() {
        let draw = WinningNumber::default();

        assert!(draw.has_won(&bet("1", "30904465", "7574")));
        assert!(!draw.has_won(&bet("1", "30904465", "1234")));
        assert!(!draw.has_won(&bet("1", "30904465", "not-a-number")));
        assert!(WinningNumber(1234).has_won(&bet("1", "30904465", "1234")));
    }

    #[test]
    fn check_agency_comparison() {
        assert!(same_agency("1", "1"));
        assert!(same_agency("01", "1"));
        assert!(!same_agency("1", "11"));
        assert!(same_agency("north", "north"));
        assert!(!same_agency("north", "1"));
        assert!(same_agency(" 7", "007"));
    }

    #[tokio::test]
    async fn finishing_twice_is_counted_once() {
        let lottery = lottery(3, Arc::default());

        assert!(lottery.mark_finished("1").await);
        assert_eq!(lottery.finished_count().await, 1);

        assert!(!lottery.mark_finished("1").await);
        assert_eq!(lottery.finished_count().await, 1);

        assert!(lottery.mark_finished("2").await);
        assert_eq!(lottery.finished_count().await, 2);
    }

    #[tokio::test]
    async fn finishing_under_another_spelling_is_counted_once() {
        let lottery = lottery(1, Arc::default());

        assert!(lottery.mark_finished("1").await);
        assert!(!lottery.mark_finished("01").await);
        assert!(!lottery.mark_finished(" 1 ").await);
        assert_eq!(lottery.finished_count().await, 1);
    }

    #[tokio::test]
    async fn winners_are_scoped_to_the_agency() {
        let store = Arc::new(MemoryStore::with_bets(vec![
            bet("1", "30904465", "7574"),
            bet("1", "25123456", "1234"),
            bet("2", "32456789", "7574"),
            bet("12", "28789012", "7574"),
        ]));
        let lottery = lottery(1, store);

        // nothing is known before the lottery ran
        assert!(lottery.winners_for("1").await.is_empty());

        assert!(lottery.run_lottery_once().await);
        assert_eq!(lottery.winners_for("1").await, ["30904465"]);
        assert_eq!(lottery.winners_for("2").await, ["32456789"]);
        assert_eq!(lottery.winners_for("12").await, ["28789012"]);
        assert!(lottery.winners_for("3").await.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn lottery_runs_exactly_once() {
        const AGENCIES: usize = 8;

        let store = Arc::new(MemoryStore::with_bets(vec![bet("1", "30904465", "7574")]));
        let lottery = lottery(AGENCIES, store.clone());

        let mut handles = vec![];
        for agency in 1..=AGENCIES {
            let lottery = lottery.clone();
            handles.push(tokio::spawn(async move {
                lottery.mark_finished(&agency.to_string()).await;
                lottery.wait_all_finished().await;
                lottery.run_lottery_once().await
            }));
        }

        let mut runs = 0;
        for handle in handles {
            if handle.await.unwrap() {
                runs += 1;
            }
        }

        assert_eq!(runs, 1);
        assert_eq!(store.loads(), 1);
        assert_eq!(lottery.finished_count().await, AGENCIES);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn winners_are_broadcast_exactly_once() {
        const AGENCIES: usize = 6;

        let store = Arc::new(MemoryStore::with_bets(
            (1..=AGENCIES)
                .flat_map(|agency| {
                    let agency = agency.to_string();
                    [
                        bet(&agency, &format!("{agency}0001"), "7574"),
                        bet(&agency, &format!("{agency}0002"), "1"),
                    ]
                })
                .collect(),
        ));
        let lottery = lottery(AGENCIES, store);

        let mut handles = vec![];
        for agency in 1..=AGENCIES {
            let lottery = lottery.clone();
            let (responder, receiver) = mpsc::channel(4);
            handles.push(tokio::spawn(async move {
                let agency = agency.to_string();
                lottery.mark_finished(&agency).await;
                lottery.wait_all_finished().await;
                lottery.run_lottery_once().await;

                lottery.enqueue_query(agency, responder).await;
                lottery.wait_all_queried().await;
                lottery.broadcast_once().await
            }));
            handles.push(tokio::spawn(async move {
                // collect everything the "connection" receives until it is closed
                let mut receiver = receiver;
                let mut received = vec![];
                while let Some(message) = receiver.recv().await {
                    received.push(message);
                }
                assert_eq!(
                    received,
                    [Message::Winners {
                        documents: vec![format!("{agency}0001")]
                    }]
                );
                false
            }));
        }

        let mut broadcasts = 0;
        for handle in handles {
            if handle.await.unwrap() {
                broadcasts += 1;
            }
        }

        assert_eq!(broadcasts, 1);
    }
}
