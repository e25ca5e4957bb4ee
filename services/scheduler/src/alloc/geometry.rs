//! Explicit task geometry.
//!
//! Two spellings are accepted, both listing task ids per node group:
//! `{0,1}{2,3}` and the grouped form `{(0,1)(2,3)}`. Every task id in
//! `[0, task_count)` must appear exactly once. Tasks in one group share a
//! node and different groups get different nodes.

use std::collections::HashMap;

use batchd_id::NodeHandle;
use thiserror::Error;

use crate::model::NodeAlloc;

/// Malformed geometry diagnostics.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GeometryError {
    #[error("task value '{0}' is invalid")]
    Invalid(String),

    #[error("task {task} exceeds the maximum task count {max}")]
    OutOfRange { task: u32, max: usize },

    #[error("task {task} exceeds the task map size {size}")]
    ExceedsTaskMap { task: u32, size: usize },

    #[error("more tasks specified in geometry than requested by job")]
    TooMany { specified: usize, requested: u32 },

    #[error("task {task} assigned to nodes {first} and {second}")]
    DoubleAssigned { task: u32, first: usize, second: usize },

    #[error("task {0} is not assigned")]
    Unassigned(u32),

    #[error("malformed geometry '{0}'")]
    Malformed(String),

    #[error("no node can host geometry group {group} ({size} tasks)")]
    NoNodeForGroup { group: usize, size: usize },
}

pub type GeometryResult<T> = Result<T, GeometryError>;

/// Parsed task groups, one per node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskGeometry {
    pub groups: Vec<Vec<u32>>,
}

/// Limits a geometry is checked against.
#[derive(Debug, Clone, Copy)]
pub struct GeometryLimits {
    pub task_count: u32,
    pub max_task_count: usize,
    pub taskmap_size: usize,
}

fn split_groups(s: &str) -> GeometryResult<Vec<&str>> {
    let grouped = s.starts_with("{(") && s.ends_with(")}");
    let (body, open, close) = if grouped {
        (&s[1..s.len() - 1], '(', ')')
    } else {
        (s, '{', '}')
    };

    let mut groups = Vec::new();
    let mut rest = body;
    while !rest.is_empty() {
        let Some(inner) = rest.strip_prefix(open) else {
            return Err(GeometryError::Malformed(s.to_string()));
        };
        let Some(end) = inner.find(close) else {
            return Err(GeometryError::Malformed(s.to_string()));
        };
        groups.push(&inner[..end]);
        rest = &inner[end + 1..];
    }
    if groups.is_empty() {
        return Err(GeometryError::Malformed(s.to_string()));
    }
    Ok(groups)
}

/// Parses and validates a geometry string.
pub fn parse_geometry(geometry: &str, limits: GeometryLimits) -> GeometryResult<TaskGeometry> {
    let compact: String = geometry.chars().filter(|c| !c.is_whitespace()).collect();
    let raw_groups = split_groups(&compact)?;

    let mut owner: HashMap<u32, usize> = HashMap::new();
    let mut groups = Vec::with_capacity(raw_groups.len());
    let mut specified = 0usize;

    for (g, raw) in raw_groups.into_iter().enumerate() {
        let mut tasks = Vec::new();
        for token in raw.split(',') {
            let task: u32 = token
                .parse()
                .map_err(|_| GeometryError::Invalid(token.to_string()))?;
            if task as usize > limits.max_task_count {
                return Err(GeometryError::OutOfRange {
                    task,
                    max: limits.max_task_count,
                });
            }
            if task as usize >= limits.taskmap_size {
                return Err(GeometryError::ExceedsTaskMap {
                    task,
                    size: limits.taskmap_size,
                });
            }
            if let Some(first) = owner.insert(task, g) {
                return Err(GeometryError::DoubleAssigned {
                    task,
                    first,
                    second: g,
                });
            }
            specified += 1;
            if specified > limits.task_count as usize {
                return Err(GeometryError::TooMany {
                    specified,
                    requested: limits.task_count,
                });
            }
            tasks.push(task);
        }
        groups.push(tasks);
    }

    if let Some(missing) = (0..limits.task_count).find(|t| !owner.contains_key(t)) {
        return Err(GeometryError::Unassigned(missing));
    }

    Ok(TaskGeometry { groups })
}

impl TaskGeometry {
    /// Maps each group to a distinct node.
    ///
    /// A node whose task count equals the group size is preferred, then any
    /// node that can host the group. Returns the per-node allocation and the
    /// node of every task id in order.
    pub fn place(&self, candidates: &[(NodeHandle, u32)]) -> GeometryResult<(Vec<NodeAlloc>, Vec<NodeHandle>)> {
        let mut used = vec![false; candidates.len()];
        let total: usize = self.groups.iter().map(Vec::len).sum();
        let mut task_nodes: Vec<Option<NodeHandle>> = vec![None; total];
        let mut allocs = Vec::with_capacity(self.groups.len());

        for (g, tasks) in self.groups.iter().enumerate() {
            let size = tasks.len();
            let pick = candidates
                .iter()
                .enumerate()
                .find(|(i, (_, tc))| !used[*i] && *tc as usize == size)
                .or_else(|| {
                    candidates
                        .iter()
                        .enumerate()
                        .find(|(i, (_, tc))| !used[*i] && *tc as usize >= size)
                })
                .map(|(i, (node, _))| (i, *node));
            let Some((i, node)) = pick else {
                return Err(GeometryError::NoNodeForGroup { group: g, size });
            };
            used[i] = true;
            for t in tasks {
                if let Some(slot) = task_nodes.get_mut(*t as usize) {
                    *slot = Some(node);
                }
            }
            allocs.push(NodeAlloc {
                node,
                task_count: size as u32,
            });
        }

        Ok((allocs, task_nodes.into_iter().flatten().collect()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use batchd_id::Handle;
    use rstest::rstest;

    fn limits(task_count: u32) -> GeometryLimits {
        GeometryLimits {
            task_count,
            max_task_count: 4096,
            taskmap_size: 64,
        }
    }

    #[rstest]
    #[case("{(0,1)(2,3)}")]
    #[case("{0,1}{2,3}")]
    #[case("{ (3, 0) (1, 2) }")]
    fn test_accepts_complete_geometry(#[case] g: &str) {
        let geo = parse_geometry(g, limits(4)).unwrap();
        assert_eq!(geo.groups.len(), 2);
    }

    #[rstest]
    #[case("{(0,1)(1,2)}", GeometryError::DoubleAssigned { task: 1, first: 0, second: 1 })]
    #[case("{(0,1)(3)}", GeometryError::Unassigned(2))]
    #[case("{(0,x)(2,3)}", GeometryError::Invalid("x".into()))]
    #[case("{(0,1)(2,3,4)}", GeometryError::TooMany { specified: 5, requested: 4 })]
    #[case("{(0,1)(2,99)}", GeometryError::ExceedsTaskMap { task: 99, size: 64 })]
    #[case("(0,1", GeometryError::Malformed("(0,1".into()))]
    fn test_rejects_with_diagnostic(#[case] g: &str, #[case] want: GeometryError) {
        assert_eq!(parse_geometry(g, limits(4)).unwrap_err(), want);
    }

    #[test]
    fn test_out_of_range_and_messages() {
        let tight = GeometryLimits {
            task_count: 2,
            max_task_count: 8,
            taskmap_size: 64,
        };
        assert_eq!(
            parse_geometry("{0}{9}", tight).unwrap_err(),
            GeometryError::OutOfRange { task: 9, max: 8 }
        );
        assert_eq!(
            GeometryError::DoubleAssigned { task: 1, first: 0, second: 1 }.to_string(),
            "task 1 assigned to nodes 0 and 1"
        );
        assert_eq!(GeometryError::Unassigned(3).to_string(), "task 3 is not assigned");
    }

    #[test]
    fn test_place_prefers_exact_fit() {
        let a = NodeHandle::from_parts(0, 0);
        let b = NodeHandle::from_parts(1, 0);
        let c = NodeHandle::from_parts(2, 0);
        let geo = parse_geometry("{(0,1)(2,3)}", limits(4)).unwrap();
        let (allocs, tasks) = geo.place(&[(a, 4), (b, 2), (c, 2)]).unwrap();
        assert_eq!(allocs.iter().map(|x| x.node).collect::<Vec<_>>(), vec![b, c]);
        assert_eq!(tasks, vec![b, b, c, c]);

        let err = geo.place(&[(a, 1), (b, 1)]).unwrap_err();
        assert_eq!(err, GeometryError::NoNodeForGroup { group: 0, size: 2 });
    }

    mod proptests {
        use super::*;
        use proptest::prelude::*;

        fn render(groups: &[Vec<u32>]) -> String {
            let inner: String = groups
                .iter()
                .map(|g| {
                    let ids: Vec<String> = g.iter().map(u32::to_string).collect();
                    format!("({})", ids.join(","))
                })
                .collect();
            format!("{{{inner}}}")
        }

        fn layout() -> impl Strategy<Value = (Vec<u32>, usize)> {
            (2u32..16).prop_flat_map(|n| {
                (Just((0..n).collect::<Vec<u32>>()).prop_shuffle(), 1usize..4)
            })
        }

        proptest! {
            #[test]
            fn complete_permutations_are_accepted((ids, chunk) in layout()) {
                let groups: Vec<Vec<u32>> = ids.chunks(chunk).map(<[u32]>::to_vec).collect();
                let geo = parse_geometry(&render(&groups), limits(ids.len() as u32));
                prop_assert!(geo.is_ok());
            }

            #[test]
            fn holes_are_named((ids, chunk) in layout(), drop in any::<prop::sample::Index>()) {
                let mut ids = ids;
                let missing = ids.remove(drop.index(ids.len()));
                let groups: Vec<Vec<u32>> = ids.chunks(chunk).map(<[u32]>::to_vec).collect();
                let n = ids.len() as u32 + 1;
                prop_assert_eq!(
                    parse_geometry(&render(&groups), limits(n)).unwrap_err(),
                    GeometryError::Unassigned(missing)
                );
            }

            #[test]
            fn duplicates_are_named((ids, chunk) in layout(), dup in any::<prop::sample::Index>()) {
                let twice = ids[dup.index(ids.len())];
                let mut groups: Vec<Vec<u32>> = ids.chunks(chunk).map(<[u32]>::to_vec).collect();
                groups.push(vec![twice]);
                let err = parse_geometry(&render(&groups), limits(ids.len() as u32)).unwrap_err();
                let is_dup = matches!(err, GeometryError::DoubleAssigned { task, .. } if task == twice);
                prop_assert!(is_dup);
            }
        }
    }
}
