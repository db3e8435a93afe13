//! Ledger demo binary
//!
//! Deposits and withdrawals for a few accounts arrive shuffled and partly
//! redelivered. The processor host applies each account's entries exactly
//! once and in sequence order, handing state from generation to generation
//! along the way. One entry is withheld until after a restart to show the
//! residual state surviving the handoff codec.

use event_serializer_core::applier::{ApplyError, EventApplier, FnApplier};
use event_serializer_core::event::Event;
use event_serializer_core::event_store::EventStore;
use event_serializer_core::stream::{ResourceId, SequenceId};
use event_serializer_runtime::metrics::MetricsServer;
use event_serializer_runtime::{HostHandle, ProcessorConfig, ProcessorHost, ResidualStores};
use rand::Rng;
use rand::seq::SliceRandom;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const ACCOUNTS: [&str; 3] = ["account-1", "account-2", "account-3"];
const ENTRIES_PER_ACCOUNT: u64 = 20;

type Balances = Arc<Mutex<BTreeMap<ResourceId, i64>>>;

/// Amount of ledger entry `id`: deposits, with a large withdrawal every 7th.
fn amount(id: u64) -> i64 {
    let id = i64::try_from(id).unwrap_or(i64::MAX);
    if id % 7 == 0 { -1_000 } else { id * 10 }
}

/// Applier that posts entries to in-memory balances, refusing overdrafts.
fn ledger(balances: Balances) -> impl EventApplier<i64> {
    FnApplier::new(move |account: &ResourceId, entry: &Event<i64>| {
        let balances = Arc::clone(&balances);
        let account = account.clone();
        let sequence_id = entry.sequence_id();
        let amount = *entry.payload();

        async move {
            let Ok(mut balances) = balances.lock() else {
                return Err(ApplyError::Failed("ledger lock poisoned".to_string()));
            };
            let balance = balances.entry(account).or_insert(0);
            if *balance + amount < 0 {
                return Err(ApplyError::Rejected {
                    sequence_id,
                    reason: format!("overdraft: balance {balance}, amount {amount}"),
                });
            }
            *balance += amount;
            Ok(())
        }
    })
}

/// Every entry once, a quarter of them twice, in random order.
fn delivery_plan(withheld: &(ResourceId, u64)) -> Vec<(ResourceId, u64)> {
    let mut rng = rand::thread_rng();
    let mut plan = Vec::new();

    for account in ACCOUNTS.map(ResourceId::new) {
        for id in 1..=ENTRIES_PER_ACCOUNT {
            if (&account, id) == (&withheld.0, withheld.1) {
                continue;
            }
            plan.push((account.clone(), id));
            if rng.gen_bool(0.25) {
                plan.push((account.clone(), id));
            }
        }
    }

    plan.shuffle(&mut rng);
    plan
}

async fn deliver(host: &HostHandle<i64>, plan: Vec<(ResourceId, u64)>) -> anyhow::Result<()> {
    for (account, id) in plan {
        host.deliver(account, Event::new(SequenceId::new(id), amount(id)))
            .await?;
    }
    Ok(())
}

fn report(title: &str, balances: &Balances, residual: &ResidualStores<i64>) {
    println!("\n--- {title} ---");
    if let Ok(balances) = balances.lock() {
        for (account, balance) in balances.iter() {
            println!("  {account}: balance {balance}");
        }
    }
    let mut accounts: Vec<_> = residual.iter().collect();
    accounts.sort_by(|a, b| a.0.cmp(b.0));
    for (account, store) in accounts {
        let pending: Vec<String> = store.pending_ids().map(|id| id.to_string()).collect();
        println!(
            "  {account}: last applied {}, pending [{}]",
            store.last_applied(),
            pending.join(", ")
        );
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "serializer_demo=info,event_serializer_runtime=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    println!("=== Ledger Demo: Ordered Event Processing ===\n");

    let mut metrics = MetricsServer::new(([127, 0, 0, 1], 9000).into());
    metrics.start()?;

    // Short generations so handoffs happen during the run
    let mut config = ProcessorConfig::from_env()?;
    config.max_events_per_generation.get_or_insert(8);
    tracing::info!(?config, "Loaded processor configuration");

    let balances: Balances = Arc::new(Mutex::new(BTreeMap::new()));
    let applier: Arc<dyn EventApplier<i64>> = Arc::new(ledger(Arc::clone(&balances)));

    // Entry 5 of account-3 shows up only after the restart
    let withheld = (ResourceId::new("account-3"), 5);
    let plan = delivery_plan(&withheld);
    println!(">>> Delivering {} entries (with redeliveries) across {} accounts", plan.len(), ACCOUNTS.len());

    let host = ProcessorHost::spawn(Arc::clone(&applier), config.clone())?;
    deliver(&host, plan).await?;
    let residual = host.shutdown().await?;
    report("After first host", &balances, &residual);

    // Persist and restore the residual state as a restart would
    let mut encoded = HashMap::new();
    for (account, store) in &residual {
        encoded.insert(account.clone(), store.to_bytes()?);
    }
    let mut restored: ResidualStores<i64> = HashMap::new();
    for (account, bytes) in encoded {
        restored.insert(account, EventStore::from_bytes(&bytes)?);
    }

    println!("\n>>> Restarting host and delivering the withheld entry {}#{}", withheld.0, withheld.1);
    let host = ProcessorHost::spawn_with_state(applier, config, restored)?;
    deliver(&host, vec![withheld.clone(), withheld]).await?;
    let residual = host.shutdown().await?;
    report("After restart", &balances, &residual);

    if let Some(rendered) = metrics.render() {
        println!("\n--- Metrics ---");
        rendered
            .lines()
            .filter(|line| line.starts_with("serializer_"))
            .for_each(|line| println!("  {line}"));
    }

    println!("\n=== Demo Complete ===");
    Ok(())
}
