//! Decision modules and the tree that combines them.
//!
//! A module is a predicate over a flow and a flat string config. The tree
//! walks from its root, following the `accept` or `reject` child of each
//! node according to that node's verdict, and stops at the first DEFER or
//! when the matching child is absent.

pub mod modules;

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::path::Path;
use std::sync::Arc;

use crate::config::{ConfigError, RuleConfig};
use crate::flow::Connection;
use crate::packet::Packet;

pub use modules::{Random, SourceRecord, SourceTime, YesNo};

pub type ModuleConfig = HashMap<String, String>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Accept,
    Reject,
    /// The module could not decide
    Defer,
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Verdict::Accept => write!(f, "accept"),
            Verdict::Reject => write!(f, "reject"),
            Verdict::Defer => write!(f, "defer"),
        }
    }
}

/// What a module gets to look at.
pub struct DecisionContext<'a> {
    pub conn: &'a Connection,
    /// Packet that triggered the evaluation
    pub packet: &'a Packet,
}

pub trait DecisionModule: Send + Sync {
    fn name(&self) -> &str;

    fn evaluate(&self, ctx: &DecisionContext<'_>, config: &ModuleConfig) -> Verdict;
}

// ============================================================================
// Registry
// ============================================================================

#[derive(Default)]
pub struct ModuleRegistry {
    modules: HashMap<String, Arc<dyn DecisionModule>>,
}

impl ModuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in modules. `source_time` persists under
    /// `state_dir` when one is given.
    pub fn with_defaults(state_dir: Option<&Path>) -> io::Result<Self> {
        let mut registry = Self::new();
        registry.register(Arc::new(YesNo));
        registry.register(Arc::new(Random::new()));
        let source_time = match state_dir {
            Some(dir) => SourceTime::open(dir.join(modules::SOURCE_TIME_FILE))?,
            None => SourceTime::in_memory(),
        };
        registry.register(Arc::new(source_time));
        Ok(registry)
    }

    /// Add or replace a module under its own name.
    pub fn register(&mut self, module: Arc<dyn DecisionModule>) {
        let name = module.name().to_string();
        if self.modules.insert(name.clone(), module).is_some() {
            log::debug!("decision module {} replaced", name);
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn DecisionModule>> {
        self.modules.get(name).cloned()
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.modules.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

// ============================================================================
// Tree
// ============================================================================

struct DecisionNode {
    module: Arc<dyn DecisionModule>,
    config: ModuleConfig,
    accept: Option<Box<DecisionNode>>,
    reject: Option<Box<DecisionNode>>,
}

impl DecisionNode {
    fn build(rule: &RuleConfig, registry: &ModuleRegistry) -> Result<Self, ConfigError> {
        let module = registry.get(&rule.module).ok_or_else(|| {
            ConfigError::Invalid(format!("unknown decision module {}", rule.module))
        })?;
        let child = |c: &Option<Box<RuleConfig>>| -> Result<Option<Box<DecisionNode>>, ConfigError> {
            match c {
                Some(r) => Ok(Some(Box::new(DecisionNode::build(r, registry)?))),
                None => Ok(None),
            }
        };
        Ok(DecisionNode {
            module,
            config: rule.config.clone(),
            accept: child(&rule.accept)?,
            reject: child(&rule.reject)?,
        })
    }
}

/// Result of walking the tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Evaluation {
    pub verdict: Verdict,
    /// `module=verdict` for every node visited
    pub trail: Vec<String>,
}

pub struct DecisionTree {
    root: DecisionNode,
}

impl DecisionTree {
    pub fn build(rule: &RuleConfig, registry: &ModuleRegistry) -> Result<Self, ConfigError> {
        Ok(DecisionTree {
            root: DecisionNode::build(rule, registry)?,
        })
    }

    pub fn evaluate(&self, ctx: &DecisionContext<'_>) -> Evaluation {
        let mut node = &self.root;
        let mut trail = Vec::new();
        loop {
            let verdict = node.module.evaluate(ctx, &node.config);
            trail.push(format!("{}={}", node.module.name(), verdict));
            let next = match verdict {
                Verdict::Accept => node.accept.as_deref(),
                Verdict::Reject => node.reject.as_deref(),
                Verdict::Defer => None,
            };
            match next {
                Some(child) => node = child,
                None => return Evaluation { verdict, trail },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::{build_tcp_frame, TcpSegment};
    use crate::flow::FlowKey;
    use crate::packet::{classify, Origin, Protocol, TcpFlags};
    use std::net::{Ipv4Addr, SocketAddrV4};
    use std::time::Instant;

    fn fixture() -> (Connection, Packet) {
        let src = SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 5), 4444);
        let dst = SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 9), 80);
        let frame = build_tcp_frame(&TcpSegment {
            src,
            dst,
            seq: 1,
            ack: 0,
            flags: TcpFlags { syn: true, ..TcpFlags::default() },
            window: 100,
            payload: &[],
        });
        let pkt = classify(&frame, 0, 0).unwrap();
        let conn = Connection::new(1, FlowKey::new(Protocol::Tcp, src, dst), Origin::Ext, 0, 10, Instant::now());
        (conn, pkt)
    }

    fn rule(module: &str, value: &str) -> RuleConfig {
        RuleConfig {
            module: module.to_string(),
            config: [("value".to_string(), value.to_string())].into_iter().collect(),
            accept: None,
            reject: None,
        }
    }

    #[test]
    fn test_registry_defaults() {
        let registry = ModuleRegistry::with_defaults(None).unwrap();
        assert_eq!(registry.names(), vec!["random", "source_time", "yesno"]);
        assert!(registry.get("yesno").is_some());
        assert!(registry.get("missing").is_none());
    }

    #[test]
    fn test_unknown_module_rejected() {
        let registry = ModuleRegistry::new();
        assert!(matches!(
            DecisionTree::build(&rule("yesno", "yes"), &registry),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn test_tree_follows_branches() {
        let registry = ModuleRegistry::with_defaults(None).unwrap();
        let (conn, pkt) = fixture();
        let ctx = DecisionContext { conn: &conn, packet: &pkt };

        let mut root = rule("yesno", "yes");
        root.accept = Some(Box::new(rule("yesno", "no")));
        let tree = DecisionTree::build(&root, &registry).unwrap();
        let eval = tree.evaluate(&ctx);
        assert_eq!(eval.verdict, Verdict::Reject);
        assert_eq!(eval.trail, vec!["yesno=accept", "yesno=reject"]);

        let mut root = rule("yesno", "no");
        root.reject = Some(Box::new(rule("yesno", "yes")));
        let tree = DecisionTree::build(&root, &registry).unwrap();
        assert_eq!(tree.evaluate(&ctx).verdict, Verdict::Accept);
    }

    #[test]
    fn test_defer_stops_walk() {
        let registry = ModuleRegistry::with_defaults(None).unwrap();
        let (conn, pkt) = fixture();
        let ctx = DecisionContext { conn: &conn, packet: &pkt };

        let mut root = rule("random", "not-a-number");
        root.accept = Some(Box::new(rule("yesno", "yes")));
        root.reject = Some(Box::new(rule("yesno", "yes")));
        let eval = DecisionTree::build(&root, &registry).unwrap().evaluate(&ctx);
        assert_eq!(eval.verdict, Verdict::Defer);
        assert_eq!(eval.trail.len(), 1);
    }

    struct Fixed(Verdict);

    impl DecisionModule for Fixed {
        fn name(&self) -> &str {
            "fixed"
        }

        fn evaluate(&self, _ctx: &DecisionContext<'_>, _config: &ModuleConfig) -> Verdict {
            self.0
        }
    }

    #[test]
    fn test_register_replaces() {
        let mut registry = ModuleRegistry::new();
        registry.register(Arc::new(Fixed(Verdict::Reject)));
        registry.register(Arc::new(Fixed(Verdict::Accept)));
        assert_eq!(registry.names(), vec!["fixed"]);

        let (conn, pkt) = fixture();
        let ctx = DecisionContext { conn: &conn, packet: &pkt };
        let tree = DecisionTree::build(&rule("fixed", ""), &registry).unwrap();
        assert_eq!(tree.evaluate(&ctx).verdict, Verdict::Accept);
    }
}
