//! In-memory packet filter and engine fixtures for unit tests.
//!
//! [`SimulatedFilter`] interprets the iptables lines the engine emits
//! (`-N -X -F -A -I -D -C`, `a || b` fallbacks, `2>/dev/null`) against a
//! table of chains, so tests can assert on the resulting rule view instead
//! of on raw command strings. Only compiled during test builds.

use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use crate::config::Config;
use crate::core::PackageRegistry;
use crate::db::RuleStore;
use crate::firewall::{PolicyEngine, PrivilegedExecutor};

/// `(table, chain)` → rule bodies in chain order.
pub type RuleView = BTreeMap<(String, String), Vec<String>>;

const BUILTIN_CHAINS: [(&str, &str); 6] = [
    ("filter", "INPUT"),
    ("filter", "OUTPUT"),
    ("filter", "FORWARD"),
    ("nat", "PREROUTING"),
    ("nat", "OUTPUT"),
    ("nat", "POSTROUTING"),
];

struct FilterState {
    chains: RuleView,
    log: Vec<String>,
    root: bool,
    comments: bool,
    fail_pattern: Option<String>,
}

pub struct SimulatedFilter {
    inner: Mutex<FilterState>,
}

impl SimulatedFilter {
    pub fn new() -> Self {
        let chains = BUILTIN_CHAINS
            .iter()
            .map(|(t, c)| ((t.to_string(), c.to_string()), Vec::new()))
            .collect();
        Self {
            inner: Mutex::new(FilterState {
                chains,
                log: Vec::new(),
                root: true,
                comments: true,
                fail_pattern: None,
            }),
        }
    }

    /// Every command fails as if `su` had been refused.
    pub fn without_root(self) -> Self {
        self.inner.lock().unwrap().root = false;
        self
    }

    /// Rules carrying `-m comment` are rejected, as on kernels without xt_comment.
    pub fn without_comments(self) -> Self {
        self.inner.lock().unwrap().comments = false;
        self
    }

    /// Make every command containing `pattern` exit with status 1.
    pub fn fail_on(&self, pattern: &str) {
        self.inner.lock().unwrap().fail_pattern = Some(pattern.to_string());
    }

    pub fn clear_failure(&self) {
        self.inner.lock().unwrap().fail_pattern = None;
    }

    pub fn view(&self) -> RuleView {
        self.inner.lock().unwrap().chains.clone()
    }

    pub fn rules(&self, table: &str, chain: &str) -> Vec<String> {
        self.inner
            .lock()
            .unwrap()
            .chains
            .get(&(table.to_string(), chain.to_string()))
            .cloned()
            .unwrap_or_default()
    }

    pub fn has_chain(&self, table: &str, chain: &str) -> bool {
        self.inner
            .lock()
            .unwrap()
            .chains
            .contains_key(&(table.to_string(), chain.to_string()))
    }

    /// Every command line received so far, in order.
    pub fn log(&self) -> Vec<String> {
        self.inner.lock().unwrap().log.clone()
    }

    pub fn clear_log(&self) {
        self.inner.lock().unwrap().log.clear();
    }
}

impl FilterState {
    fn run_line(&mut self, line: &str) -> i32 {
        let mut code = 1;
        for (i, alternative) in line.split(" || ").enumerate() {
            if i > 0 && code == 0 {
                break;
            }
            code = self.run_single(alternative);
        }
        code
    }

    fn run_single(&mut self, command: &str) -> i32 {
        let tokens: Vec<&str> = command
            .split_whitespace()
            .filter(|t| *t != "2>/dev/null")
            .collect();
        match tokens.as_slice() {
            ["true"] => return 0,
            ["id"] => return if self.root { 0 } else { 1 },
            _ => {}
        }
        if !self.root {
            return 1;
        }
        if let Some(pattern) = &self.fail_pattern {
            if command.contains(pattern.as_str()) {
                return 1;
            }
        }
        if tokens.first().map_or(true, |bin| !bin.ends_with("iptables")) {
            return 127;
        }

        let mut rest = &tokens[1..];
        let mut table = "filter";
        if let ["-t", t, tail @ ..] = rest {
            table = *t;
            rest = tail;
        }
        let [op, chain, args @ ..] = rest else {
            return 2;
        };
        if !self.comments && args.windows(2).any(|w| w == ["-m", "comment"]) {
            return 2;
        }
        let key = (table.to_string(), chain.to_string());

        match *op {
            "-N" => {
                if self.chains.contains_key(&key) {
                    return 1;
                }
                self.chains.insert(key, Vec::new());
                0
            }
            "-X" => match self.chains.get(&key) {
                Some(rules) if rules.is_empty() => {
                    self.chains.remove(&key);
                    0
                }
                _ => 1,
            },
            "-F" => match self.chains.get_mut(&key) {
                Some(rules) => {
                    rules.clear();
                    0
                }
                None => 1,
            },
            "-A" => match self.chains.get_mut(&key) {
                Some(rules) => {
                    rules.push(args.join(" "));
                    0
                }
                None => 1,
            },
            "-I" => {
                let Some(rules) = self.chains.get_mut(&key) else {
                    return 1;
                };
                let (position, body) = match args.split_first() {
                    Some((n, body)) if n.parse::<usize>().is_ok() => {
                        (n.parse::<usize>().unwrap_or(1).max(1) - 1, body)
                    }
                    _ => (0, args),
                };
                // iptables rejects positions past the end of the chain.
                if position > rules.len() {
                    return 1;
                }
                rules.insert(position, body.join(" "));
                0
            }
            "-D" => {
                let Some(rules) = self.chains.get_mut(&key) else {
                    return 1;
                };
                let body = args.join(" ");
                match rules.iter().position(|r| *r == body) {
                    Some(i) => {
                        rules.remove(i);
                        0
                    }
                    None => 1,
                }
            }
            "-C" => match self.chains.get(&key) {
                Some(rules) if rules.contains(&args.join(" ")) => 0,
                _ => 1,
            },
            _ => 2,
        }
    }
}

impl PrivilegedExecutor for SimulatedFilter {
    fn execute(&self, commands: &[String]) -> anyhow::Result<Vec<i32>> {
        let mut state = self.inner.lock().unwrap();
        let mut codes = Vec::with_capacity(commands.len());
        for line in commands {
            state.log.push(line.clone());
            let code = state.run_line(line);
            codes.push(code);
        }
        Ok(codes)
    }
}

/// Fixed set of installed packages.
impl PackageRegistry for HashSet<String> {
    fn is_installed(&self, package: &str) -> bool {
        self.contains(package)
    }
}

/// A policy engine wired to a [`SimulatedFilter`] and a temporary data dir.
pub struct EngineFixture {
    pub dir: tempfile::TempDir,
    pub config: Config,
    pub filter: Arc<SimulatedFilter>,
    pub store: Arc<RuleStore>,
    pub engine: Arc<PolicyEngine>,
}

impl EngineFixture {
    /// Engine over a fresh filter; capabilities are probed already.
    pub fn new() -> Self {
        Self::with_filter(SimulatedFilter::new())
    }

    pub fn with_filter(filter: SimulatedFilter) -> Self {
        let fixture = Self::uninitialized(filter);
        fixture.engine.initialize().unwrap();
        fixture
    }

    pub fn uninitialized(filter: SimulatedFilter) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let binary = dir.path().join("iptables");
        std::fs::write(&binary, "").unwrap();

        let mut config = Config::default();
        config.paths.data_dir = dir.path().to_path_buf();
        config.paths.filter_binaries = vec![PathBuf::from("/nonexistent/iptables"), binary];
        config.paths.init_script = dir.path().join("91onionwall");
        config.paths.packages_list = dir.path().join("packages.list");

        let filter = Arc::new(filter);
        let store = Arc::new(RuleStore::open(&config.rules_db_path()).unwrap());
        let engine = Self::open_engine(&config, &store, &filter);

        Self {
            dir,
            config,
            filter,
            store,
            engine,
        }
    }

    /// A second engine over the same data dir and filter, as another process would see it.
    pub fn reopen(&self) -> Arc<PolicyEngine> {
        Self::open_engine(&self.config, &self.store, &self.filter)
    }

    fn open_engine(
        config: &Config,
        store: &Arc<RuleStore>,
        filter: &Arc<SimulatedFilter>,
    ) -> Arc<PolicyEngine> {
        let installed: HashSet<String> = [config.daemons.onion_package.clone()].into();
        PolicyEngine::new(
            Arc::clone(store),
            Arc::clone(filter) as Arc<dyn PrivilegedExecutor>,
            Arc::new(installed),
            config.clone(),
        )
        .unwrap()
    }

    pub fn filter_rules(&self) -> Vec<String> {
        self.filter.rules("filter", "ow_out")
    }

    pub fn nat_rules(&self) -> Vec<String> {
        self.filter.rules("nat", "ow_nat")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(filter: &SimulatedFilter, lines: &[&str]) -> Vec<i32> {
        let lines: Vec<String> = lines.iter().map(|l| l.to_string()).collect();
        filter.execute(&lines).unwrap()
    }

    #[test]
    fn test_chain_lifecycle() {
        let filter = SimulatedFilter::new();
        let codes = run(
            &filter,
            &[
                "iptables -t filter -N ow_out",
                "iptables -t filter -N ow_out",
                "iptables -t filter -A ow_out -j REJECT",
                "iptables -t filter -I ow_out 1 -d 10.0.0.0/8 -j ACCEPT",
                "iptables -t filter -X ow_out",
            ],
        );
        assert_eq!(codes, vec![0, 1, 0, 0, 1]);
        assert_eq!(
            filter.rules("filter", "ow_out"),
            vec!["-d 10.0.0.0/8 -j ACCEPT", "-j REJECT"]
        );
    }

    #[test]
    fn test_insert_position_past_end_fails() {
        let filter = SimulatedFilter::new();
        let codes = run(
            &filter,
            &[
                "iptables -t filter -N ow_out",
                "iptables -t filter -I ow_out 2 -j REJECT",
                "iptables -t filter -I ow_out 1 -j REJECT",
                "iptables -t filter -I ow_out 2 -d 10.0.0.0/8 -j ACCEPT",
            ],
        );
        assert_eq!(codes, vec![0, 1, 0, 0]);
        assert_eq!(
            filter.rules("filter", "ow_out"),
            vec!["-j REJECT", "-d 10.0.0.0/8 -j ACCEPT"]
        );
    }

    #[test]
    fn test_fallback_runs_only_after_failure() {
        let filter = SimulatedFilter::new();
        let hook = "iptables -t filter -C OUTPUT -j ow_out 2>/dev/null || iptables -t filter -I OUTPUT 1 -j ow_out";
        assert_eq!(run(&filter, &[hook, hook]), vec![0, 0]);
        assert_eq!(filter.rules("filter", "OUTPUT"), vec!["-j ow_out"]);
    }

    #[test]
    fn test_delete_requires_exact_body() {
        let filter = SimulatedFilter::new();
        let codes = run(
            &filter,
            &[
                "iptables -t nat -A OUTPUT -p tcp -j RETURN",
                "iptables -t nat -D OUTPUT -p udp -j RETURN",
                "iptables -t nat -D OUTPUT -p tcp -j RETURN",
            ],
        );
        assert_eq!(codes, vec![0, 1, 0]);
    }

    #[test]
    fn test_comment_rules_rejected_without_support() {
        let filter = SimulatedFilter::new().without_comments();
        let codes = run(
            &filter,
            &["iptables -t filter -A OUTPUT -m comment --comment x -j ACCEPT"],
        );
        assert_eq!(codes, vec![2]);
    }

    #[test]
    fn test_without_root_everything_fails() {
        let filter = SimulatedFilter::new().without_root();
        assert_eq!(run(&filter, &["id", "iptables -t filter -F OUTPUT"]), vec![1, 1]);
    }

    #[test]
    fn test_injected_failure() {
        let filter = SimulatedFilter::new();
        filter.fail_on("-F OUTPUT");
        assert_eq!(run(&filter, &["iptables -t filter -F OUTPUT"]), vec![1]);
        filter.clear_failure();
        assert_eq!(run(&filter, &["iptables -t filter -F OUTPUT"]), vec![0]);
        assert_eq!(filter.log().len(), 2);
    }
}
