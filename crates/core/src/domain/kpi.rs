use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct KpiId(pub String);

impl fmt::Display for KpiId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A task's declared link to a KPI; `weight` is a percentage of the KPI.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct KpiLink {
    pub kpi_id: KpiId,
    pub weight: Decimal,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct KpiContribution {
    pub kpi_id: KpiId,
    pub amount: Decimal,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct KpiAchievement {
    pub kpi_id: KpiId,
    pub name: String,
    pub achievement: Decimal,
    pub updated_at: DateTime<Utc>,
}

impl KpiAchievement {
    pub fn new(kpi_id: KpiId, name: impl Into<String>, at: DateTime<Utc>) -> Self {
        Self { kpi_id, name: name.into(), achievement: Decimal::ZERO, updated_at: at }
    }

    /// Adds `amount`, keeping the running achievement within 0..=100. Returns the
    /// delta actually applied.
    pub fn apply(&mut self, amount: Decimal, at: DateTime<Utc>) -> Decimal {
        let before = self.achievement;
        self.achievement = (before + amount).clamp(Decimal::ZERO, MAX_ACHIEVEMENT);
        self.updated_at = at;
        self.achievement - before
    }
}

pub const MAX_ACHIEVEMENT: Decimal = Decimal::ONE_HUNDRED;

/// `round(grade / 5 * weight / 100 * 100, 2)` for each linked KPI.
pub fn contributions_for(grade: Decimal, links: &[KpiLink]) -> Vec<KpiContribution> {
    let five = Decimal::from(5);
    links
        .iter()
        .map(|link| KpiContribution {
            kpi_id: link.kpi_id.clone(),
            amount: round_2(
                grade / five * (link.weight / Decimal::ONE_HUNDRED) * Decimal::ONE_HUNDRED,
            ),
        })
        .collect()
}

pub(crate) fn round_2(value: Decimal) -> Decimal {
    value.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero)
}

/// In-process KPI ledger; persistent stores apply the same clamp.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct KpiScoreboard {
    achievements: BTreeMap<KpiId, KpiAchievement>,
}

impl KpiScoreboard {
    pub fn register(&mut self, achievement: KpiAchievement) {
        self.achievements.insert(achievement.kpi_id.clone(), achievement);
    }

    pub fn get(&self, kpi_id: &KpiId) -> Option<&KpiAchievement> {
        self.achievements.get(kpi_id)
    }

    pub fn achievements(&self) -> impl Iterator<Item = &KpiAchievement> {
        self.achievements.values()
    }

    /// Applies every contribution to a registered KPI; unknown KPIs are returned.
    pub fn apply_all(
        &mut self,
        contributions: &[KpiContribution],
        at: DateTime<Utc>,
    ) -> Vec<KpiId> {
        let mut unknown = Vec::new();
        for contribution in contributions {
            match self.achievements.get_mut(&contribution.kpi_id) {
                Some(achievement) => {
                    achievement.apply(contribution.amount, at);
                }
                None => unknown.push(contribution.kpi_id.clone()),
            }
        }
        unknown
    }
}
