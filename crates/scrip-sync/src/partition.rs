use scrip_core::WorkItem;
use serde::Serialize;
use url::Url;

use crate::config::ConfigError;
use crate::reference::{normalize_subject, ReferenceMap};

/// Row `i` belongs to this shard when `i % step == index`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ShardSpec {
    pub index: usize,
    pub step: usize,
}

impl ShardSpec {
    pub fn single() -> Self {
        Self { index: 0, step: 1 }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.step == 0 {
            return Err(ConfigError::Invalid {
                name: "SHARD_STEP",
                expected: "at least 1",
                value: "0".into(),
            });
        }
        if self.index >= self.step {
            return Err(ConfigError::ShardOutOfRange {
                index: self.index,
                step: self.step,
            });
        }
        Ok(())
    }

    pub fn owns(&self, row: usize) -> bool {
        self.step > 0 && row % self.step == self.index
    }
}

/// Zero-based column positions in the primary table.
#[derive(Debug, Clone)]
pub struct PrimaryLayout {
    pub subject: usize,
    pub target: usize,
    pub target_host: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum Planned {
    Ready(WorkItem),
    /// Structurally invalid row. It still occupies its index so the checkpoint can pass it.
    Malformed {
        index: usize,
        subject: String,
        reason: String,
    },
}

impl Planned {
    pub fn index(&self) -> usize {
        match self {
            Planned::Ready(item) => item.index,
            Planned::Malformed { index, .. } => *index,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Plan {
    pub entries: Vec<Planned>,
}

impl Plan {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn indices(&self) -> Vec<usize> {
        self.entries.iter().map(Planned::index).collect()
    }

    pub fn ready_count(&self) -> usize {
        self.entries
            .iter()
            .filter(|e| matches!(e, Planned::Ready(_)))
            .count()
    }

    pub fn malformed_count(&self) -> usize {
        self.len() - self.ready_count()
    }
}

fn cell(row: &[String], column: usize) -> &str {
    row.get(column).map(|c| c.trim()).unwrap_or("")
}

pub fn validate_target(target: &str, required_host: Option<&str>) -> Result<(), String> {
    if target.is_empty() {
        return Err("missing target".to_string());
    }
    let url = Url::parse(target).map_err(|e| format!("target `{target}` is not a URL: {e}"))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(format!("target scheme `{}` is not http(s)", url.scheme()));
    }
    if let Some(fragment) = required_host.map(str::trim).filter(|h| !h.is_empty()) {
        let host = url.host_str().unwrap_or_default().to_ascii_lowercase();
        if !host.contains(&fragment.to_ascii_lowercase()) {
            return Err(format!("target host `{host}` does not match `{fragment}`"));
        }
    }
    Ok(())
}

/// Pending shard-owned rows above `checkpoint`, in source order.
pub fn partition(
    rows: &[Vec<String>],
    layout: &PrimaryLayout,
    shard: ShardSpec,
    checkpoint: i64,
    max_index: Option<usize>,
    references: &ReferenceMap,
) -> Plan {
    let entries = rows
        .iter()
        .enumerate()
        .filter(|(i, _)| shard.owns(*i) && (*i as i64) > checkpoint)
        .take_while(|(i, _)| max_index.map_or(true, |max| *i <= max))
        .map(|(index, row)| {
            let subject = normalize_subject(cell(row, layout.subject));
            let target = cell(row, layout.target);
            if subject.is_empty() {
                return Planned::Malformed {
                    index,
                    subject,
                    reason: "missing subject key".to_string(),
                };
            }
            if let Err(reason) = validate_target(target, layout.target_host.as_deref()) {
                return Planned::Malformed {
                    index,
                    subject,
                    reason,
                };
            }
            let aux_date = references.lookup(&subject).map(ToString::to_string);
            Planned::Ready(WorkItem {
                index,
                subject_key: subject,
                target: target.to_string(),
                aux_date,
            })
        })
        .collect();
    Plan { entries }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rows(n: usize) -> Vec<Vec<String>> {
        (0..n)
            .map(|i| vec![format!("s{i}"), format!("https://www.example.com/symbols/S{i}/")])
            .collect()
    }

    fn layout() -> PrimaryLayout {
        PrimaryLayout {
            subject: 0,
            target: 1,
            target_host: Some("example.com".into()),
        }
    }

    #[test]
    fn shard_and_checkpoint_filter_rows() {
        let plan = partition(&rows(5), &layout(), ShardSpec { index: 0, step: 2 }, -1, None, &ReferenceMap::empty());
        assert_eq!(plan.indices(), vec![0, 2, 4]);

        let plan = partition(&rows(10), &layout(), ShardSpec { index: 1, step: 3 }, 4, None, &ReferenceMap::empty());
        assert_eq!(plan.indices(), vec![7]);
    }

    #[test]
    fn max_index_is_a_hard_stop() {
        let plan = partition(&rows(10), &layout(), ShardSpec::single(), -1, Some(3), &ReferenceMap::empty());
        assert_eq!(plan.indices(), vec![0, 1, 2, 3]);
    }

    #[test]
    fn malformed_rows_keep_their_index() {
        let mut data = rows(4);
        data[1][0] = "  ".into();
        data[2][1] = "ftp://example.com/x".into();
        data[3][1] = "https://elsewhere.org/x".into();
        let plan = partition(&data, &layout(), ShardSpec::single(), -1, None, &ReferenceMap::empty());
        assert_eq!(plan.indices(), vec![0, 1, 2, 3]);
        assert_eq!(plan.ready_count(), 1);
        assert_eq!(plan.malformed_count(), 3);
    }

    #[test]
    fn short_rows_are_malformed_not_dropped() {
        let data = vec![vec!["ONLY".to_string()]];
        let plan = partition(&data, &layout(), ShardSpec::single(), -1, None, &ReferenceMap::empty());
        assert!(matches!(&plan.entries[0], Planned::Malformed { reason, .. } if reason == "missing target"));
    }

    #[test]
    fn reference_dates_are_attached() {
        let refs = ReferenceMap::from_rows(&[vec!["S1".into(), "2024/03/05".into()]], 0, 1);
        let plan = partition(&rows(2), &layout(), ShardSpec::single(), -1, None, &refs);
        let dates = plan
            .entries
            .iter()
            .map(|e| match e {
                Planned::Ready(item) => item.aux_date.clone(),
                Planned::Malformed { .. } => None,
            })
            .collect::<Vec<_>>();
        assert_eq!(dates, vec![None, Some("2024-03-05".to_string())]);
    }

    #[test]
    fn shard_spec_validation() {
        assert!(ShardSpec { index: 0, step: 0 }.validate().is_err());
        assert!(ShardSpec { index: 2, step: 2 }.validate().is_err());
        assert!(ShardSpec { index: 1, step: 2 }.validate().is_ok());
    }
}
