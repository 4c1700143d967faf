use super::discovery::Endpoint;
use rand::Rng;
use std::sync::atomic::{AtomicU64, Ordering};

/// Weighted instance list using a prefix sum, so selection is a binary search
/// instead of a scan.
pub struct WeightedNodes {
    nodes: Vec<Endpoint>,
    prefix_sum: Vec<u64>,
    total_weight: u64,
}

impl WeightedNodes {
    fn new(nodes: Vec<(Endpoint, u32)>) -> Self {
        let mut prefix_sum = Vec::with_capacity(nodes.len());
        let mut sum: u64 = 0;
        for (_, weight) in &nodes {
            sum += (*weight).max(1) as u64;
            prefix_sum.push(sum);
        }
        Self {
            nodes: nodes.into_iter().map(|(e, _)| e).collect(),
            prefix_sum,
            total_weight: sum,
        }
    }

    fn pick(&self, target: u64) -> Option<&Endpoint> {
        let idx = self.prefix_sum.partition_point(|&s| s <= target);
        self.nodes.get(idx)
    }
}

/// Instance selection for one service. Unknown `lb` names fall back to
/// round-robin.
pub enum Balancer {
    RoundRobin {
        nodes: WeightedNodes,
        counter: AtomicU64,
    },
    Random {
        nodes: WeightedNodes,
    },
}

impl Balancer {
    pub fn new(lb: &str, nodes: Vec<(Endpoint, u32)>) -> Self {
        let nodes = WeightedNodes::new(nodes);
        match lb {
            "random" => Balancer::Random { nodes },
            _ => Balancer::RoundRobin {
                nodes,
                counter: AtomicU64::new(0),
            },
        }
    }

    pub fn select(&self) -> Option<&Endpoint> {
        match self {
            Balancer::RoundRobin { nodes, counter } => {
                if nodes.total_weight == 0 {
                    return None;
                }
                let count = counter.fetch_add(1, Ordering::Relaxed);
                nodes.pick(count % nodes.total_weight)
            }
            Balancer::Random { nodes } => {
                if nodes.total_weight == 0 {
                    return None;
                }
                let target = rand::thread_rng().gen_range(0..nodes.total_weight);
                nodes.pick(target)
            }
        }
    }

    pub fn instance_count(&self) -> usize {
        match self {
            Balancer::RoundRobin { nodes, .. } | Balancer::Random { nodes } => nodes.nodes.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn node(host: &str, weight: u32) -> (Endpoint, u32) {
        (
            Endpoint {
                scheme: "http".to_string(),
                host: host.to_string(),
                port: 80,
            },
            weight,
        )
    }

    fn count(lb: &Balancer, n: usize) -> HashMap<String, usize> {
        let mut counts = HashMap::new();
        for _ in 0..n {
            let e = lb.select().unwrap();
            *counts.entry(e.host.clone()).or_insert(0) += 1;
        }
        counts
    }

    #[test]
    fn test_round_robin_weighted() {
        let lb = Balancer::new("roundrobin", vec![node("A", 2), node("B", 3)]);
        let counts = count(&lb, 5000);
        assert_eq!(counts["A"], 2000);
        assert_eq!(counts["B"], 3000);
    }

    #[test]
    fn test_round_robin_zero_weight_treated_as_one() {
        let lb = Balancer::new("roundrobin", vec![node("A", 0), node("B", 1)]);
        let counts = count(&lb, 100);
        assert_eq!(counts["A"], 50);
        assert_eq!(counts["B"], 50);
    }

    #[test]
    fn test_random_weighted_distribution() {
        let lb = Balancer::new("random", vec![node("A", 1), node("B", 9)]);
        let counts = count(&lb, 10_000);
        let b = counts["B"];
        assert!(b > 8_500 && b < 9_500, "b={b}");
    }

    #[test]
    fn test_empty() {
        assert!(Balancer::new("roundrobin", vec![]).select().is_none());
        assert!(Balancer::new("random", vec![]).select().is_none());
    }

    #[test]
    fn test_unknown_lb_is_round_robin() {
        let lb = Balancer::new("chash", vec![node("A", 1)]);
        assert!(matches!(lb, Balancer::RoundRobin { .. }));
        assert_eq!(lb.instance_count(), 1);
    }
}
