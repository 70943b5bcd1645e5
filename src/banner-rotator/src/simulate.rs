//! In-memory rotation against synthetic click-through rates.

use anyhow::Context;
use clap::Args;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rotator_core::config::EngineConfig;
use rotator_core::event_bus::noop_sink;
use rotator_core::types::{BannerId, SocialGroupId};
use rotator_decision::{AssignmentManager, DecisionEngine};
use rotator_store::{CatalogStore, CounterStore, MemoryStore};
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;
use tracing::info;

#[derive(Args, Debug)]
pub struct SimulateArgs {
    /// Number of banners competing for the slot
    #[arg(long, default_value_t = 3)]
    banners: usize,

    /// Number of social groups sharing the slot
    #[arg(long, default_value_t = 2)]
    groups: usize,

    /// Number of decisions to make
    #[arg(long, default_value_t = 10_000)]
    rounds: u64,

    #[arg(long, default_value_t = 42)]
    seed: u64,

    /// Click-through rate per banner, comma separated
    #[arg(long, value_delimiter = ',')]
    ctr: Vec<f64>,
}

#[derive(Debug, Serialize)]
struct BannerReport {
    banner_id: BannerId,
    ctr: f64,
    displays: u64,
    clicks: u64,
    share: f64,
}

pub async fn run(
    args: SimulateArgs,
    engine_config: &EngineConfig,
) -> anyhow::Result<serde_json::Value> {
    if args.banners == 0 || args.groups == 0 {
        anyhow::bail!("simulate needs at least one banner and one group");
    }
    let ctr: Vec<f64> = if args.ctr.is_empty() {
        (0..args.banners).map(|i| 0.02 * (i as f64 + 1.0)).collect()
    } else if args.ctr.len() == args.banners {
        args.ctr.clone()
    } else {
        anyhow::bail!(
            "--ctr lists {} rates for {} banners",
            args.ctr.len(),
            args.banners
        );
    };
    if let Some(bad) = ctr.iter().find(|p| !(0.0..=1.0).contains(*p)) {
        anyhow::bail!("click-through rate {bad} is outside [0, 1]");
    }

    let store = Arc::new(MemoryStore::new());
    let mut groups = Vec::with_capacity(args.groups);
    for i in 0..args.groups {
        groups.push(store.create_social_group(&format!("group-{i}")).await?.id);
    }
    let slot = store.create_slot("simulated").await?.id;

    let engine = DecisionEngine::new(store.clone(), noop_sink(), engine_config.clone());
    let manager = AssignmentManager::new(store.clone(), noop_sink(), engine_config);
    let mut banners = Vec::with_capacity(args.banners);
    for i in 0..args.banners {
        let banner = store.create_banner(&format!("banner-{i}")).await?.id;
        manager
            .add_assignment(banner, slot)
            .await
            .context("assigning simulated banner")?;
        banners.push(banner);
    }

    info!(
        banners = args.banners,
        groups = args.groups,
        rounds = args.rounds,
        seed = args.seed,
        "Starting simulation"
    );

    let mut rng = StdRng::seed_from_u64(args.seed);
    let mut clicks = vec![0u64; banners.len()];
    for _ in 0..args.rounds {
        let group = groups[rng.gen_range(0..groups.len())];
        let banner = engine.choose_banner(slot, group).await?;
        let Some(index) = banners.iter().position(|b| *b == banner) else {
            anyhow::bail!("engine chose unknown banner {banner}");
        };
        if rng.gen::<f64>() < ctr[index] {
            engine.record_click(banner, slot, group).await?;
            clicks[index] += 1;
        }
    }

    let mut displays = vec![0u64; banners.len()];
    let mut per_group = Vec::with_capacity(groups.len());
    for group in &groups {
        let snapshot = store.get_arms(slot, *group).await?;
        for (i, banner) in banners.iter().enumerate() {
            if let Some(arm) = snapshot.arm(*banner) {
                displays[i] += arm.trials;
            }
        }
        per_group.push(group_report(*group, &snapshot));
    }

    let total: u64 = displays.iter().sum();
    let report: Vec<BannerReport> = banners
        .iter()
        .enumerate()
        .map(|(i, banner)| BannerReport {
            banner_id: *banner,
            ctr: ctr[i],
            displays: displays[i],
            clicks: clicks[i],
            share: if total == 0 {
                0.0
            } else {
                displays[i] as f64 / total as f64
            },
        })
        .collect();

    Ok(json!({
        "rounds": args.rounds,
        "seed": args.seed,
        "banners": report,
        "groups": per_group,
    }))
}

fn group_report(group: SocialGroupId, snapshot: &rotator_core::ArmSnapshot) -> serde_json::Value {
    // Scores are undefined until every arm is tried and the slot has two displays.
    let scores = rotator_rl_engine::scores(&snapshot.arms, snapshot.slot_total_display).ok();
    json!({
        "social_group_id": group,
        "slot_displays": snapshot.slot_total_display,
        "scores": scores,
    })
}
