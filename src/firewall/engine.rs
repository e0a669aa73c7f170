//! Policy reconciliation engine.
//!
//! `PolicyEngine` turns the persisted [`PolicyState`], together with a fresh
//! read of the [`RuleStore`], into ordered packet-filter batches. The full
//! reconciliation always flushes the owned chains and rebuilds them. A single
//! toggle inserts each rule of its group at the position the full
//! reconciliation would give it, or deletes the group, and falls back to a
//! full reconciliation whenever a command fails or the chains were never
//! built.
//!
//! `state.json` is shared with other invocations: reads reload it and every
//! mutation is applied to a freshly loaded copy.

use std::collections::BTreeMap;
use std::sync::{mpsc, Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use super::bypass::{BypassScheduler, RevertFn};
use super::probe;
use super::ruleset::{RuleSet, RuleSpec};
use super::PrivilegedExecutor;
use crate::config::Config;
use crate::core::{unix_now, AppRule, Capabilities, PackageRegistry, PolicyState};
use crate::db::RuleStore;
use crate::error::AppError;
use crate::services::BackgroundServices;

/// A state change recorded only once its rules are in the kernel.
type Commit<'a> = &'a dyn Fn(&mut PolicyState);

pub struct PolicyEngine {
    store: Arc<RuleStore>,
    executor: Arc<dyn PrivilegedExecutor>,
    registry: Arc<dyn PackageRegistry>,
    config: Config,
    /// Last state read from or written to disk.
    state: Mutex<PolicyState>,
    /// Serializes batch execution so two batches never interleave in the kernel.
    apply_lock: Mutex<()>,
    scheduler: BypassScheduler,
    background: BackgroundServices,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl PolicyEngine {
    /// Build an engine, restoring persisted state from the data directory.
    pub fn new(
        store: Arc<RuleStore>,
        executor: Arc<dyn PrivilegedExecutor>,
        registry: Arc<dyn PackageRegistry>,
        config: Config,
    ) -> Result<Arc<Self>, AppError> {
        let state = PolicyState::load(&config.state_path())?;
        let scheduler = BypassScheduler::new(Duration::from_secs(config.bypass.tick_secs));
        Ok(Arc::new(Self {
            store,
            executor,
            registry,
            config,
            state: Mutex::new(state),
            apply_lock: Mutex::new(()),
            scheduler,
            background: BackgroundServices::start()?,
        }))
    }

    // ---- State accessors ----

    /// Current state as persisted, including changes made by other processes.
    pub fn state(&self) -> PolicyState {
        let mut cached = lock(&self.state);
        match PolicyState::load(&self.config.state_path()) {
            Ok(fresh) => *cached = fresh,
            Err(e) => tracing::warn!("Reloading policy state failed, using cached copy: {e}"),
        }
        cached.clone()
    }

    pub fn capabilities(&self) -> Capabilities {
        self.state().capabilities()
    }

    pub fn scheduler(&self) -> &BypassScheduler {
        &self.scheduler
    }

    pub fn store(&self) -> &RuleStore {
        &self.store
    }

    /// Read-modify-write against the file, so concurrent invocations that
    /// touch different fields do not undo each other.
    fn update_state(&self, mutate: impl FnOnce(&mut PolicyState)) -> PolicyState {
        let path = self.config.state_path();
        let mut cached = lock(&self.state);
        let mut fresh = PolicyState::load(&path).unwrap_or_else(|e| {
            tracing::warn!("Reloading policy state failed, using cached copy: {e}");
            cached.clone()
        });
        mutate(&mut fresh);
        if let Err(e) = fresh.save(&path) {
            tracing::warn!("Failed to persist policy state: {e}");
        }
        *cached = fresh.clone();
        fresh
    }

    fn ruleset(&self, state: &PolicyState) -> RuleSet {
        let binary = state
            .filter_binary
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "iptables".to_string());
        RuleSet::new(binary, state.comment_annotations_supported, &self.config)
    }

    // ---- Capability detection ----

    /// Probe root, filter binary, comment support, the init script and the
    /// onion client. Unhooked chains (after a reboot) mark the policy unapplied.
    pub fn initialize(&self) -> Result<Capabilities, AppError> {
        let report = probe::detect(self.executor.as_ref(), &self.config, self.registry.as_ref());
        let state = self.update_state(|s| {
            s.root_available = report.root_available;
            s.filter_binary_present = report.filter_binary.is_some();
            s.filter_binary = report.filter_binary.clone();
            s.comment_annotations_supported = report.comment_annotations_supported;
            s.init_script_installed = report.init_script_installed;
            s.onion_client_installed = report.onion_client_installed;
            s.policy_applied = s.policy_applied && report.chains_hooked;
        });
        let caps = state.capabilities();
        tracing::info!(
            "Capabilities: root={} iptables={} comments={} init_script={} onion_client={}",
            caps.root_available,
            caps.filter_binary_present,
            caps.comment_annotations_supported,
            caps.init_script_installed,
            caps.onion_client_installed
        );
        if !caps.root_available {
            tracing::warn!("Root access not granted; policy cannot be applied");
        }
        Ok(caps)
    }

    /// Fail unless the policy can be applied at all. Missing root forces the
    /// master switch off.
    fn require_capabilities(&self) -> Result<PolicyState, AppError> {
        let state = self.state();
        if !state.filter_binary_present {
            return Err(AppError::CapabilityMissing(
                "no iptables binary found on this device".into(),
            ));
        }
        if !state.root_available {
            if state.master_enabled {
                self.update_state(|s| s.master_enabled = false);
                tracing::warn!("Master switch forced off: root access not granted");
            }
            return Err(AppError::PrivilegeDenied("root access not granted".into()));
        }
        Ok(state)
    }

    // ---- Batch execution ----

    fn run_batch(&self, lines: &[String]) -> Result<(), AppError> {
        let codes = self.executor.execute(lines)?;
        if codes.len() != lines.len() {
            return Err(AppError::CommandFailed(format!(
                "executor reported {} exit codes for {} commands",
                codes.len(),
                lines.len()
            )));
        }
        if let Some((line, code)) = lines.iter().zip(&codes).find(|(_, code)| **code != 0) {
            tracing::error!("Privileged command failed ({code}): {line}");
            return Err(AppError::command_failed(line, *code));
        }
        Ok(())
    }

    /// Policy rules for `state` in reconciliation order, empty when the
    /// master switch is off.
    fn plan_specs(&self, state: &PolicyState, rs: &RuleSet, now: u64) -> Result<Vec<RuleSpec>, AppError> {
        let mut specs: Vec<RuleSpec> = Vec::new();
        if !state.master_enabled {
            return Ok(specs);
        }
        if let Some(uid) = state.live_captive_uid(now) {
            specs.extend(rs.captive_bypass(uid));
        }
        if state.lan_bypass_enabled {
            specs.extend(rs.lan_bypass());
        }
        specs.extend(rs.daemon_accepts());
        if state.sip_enabled {
            if let Some(uid) = state.designated_sip_uid {
                specs.extend(rs.sip_redirect(uid));
            }
        }

        let mut rules = self.store.get_all()?;
        rules.sort_by_key(|r| r.uid);
        for rule in &rules {
            specs.extend(rs.app_rule(rule));
        }

        if state.tether_enabled {
            specs.extend(rs.tether());
        }
        specs.push(rs.catch_all());
        Ok(specs)
    }

    fn plan_for(&self, state: &PolicyState, now: u64) -> Result<Vec<String>, AppError> {
        let rs = self.ruleset(state);
        let mut lines = rs.ensure_and_flush();
        let specs = self.plan_specs(state, &rs, now)?;
        lines.extend(specs.iter().map(|s| rs.append(s)));
        Ok(lines)
    }

    /// The ordered batch a full reconciliation would run, without running it.
    pub fn plan_full_policy(&self) -> Result<Vec<String>, AppError> {
        self.plan_for(&self.state(), unix_now())
    }

    /// Flush the owned chains and, when enabled, rebuild the whole policy.
    ///
    /// A failed command fails the whole operation; callers retry a full
    /// reconciliation rather than patching the chains. A captive exemption
    /// whose deadline has passed is left out and cleared from the state.
    pub fn apply_full_policy(&self) -> Result<(), AppError> {
        self.rebuild(&|_| {})
    }

    /// Full reconciliation with a single retry on command failure.
    pub fn apply_with_retry(&self) -> Result<(), AppError> {
        self.rebuild_with_retry(&|_| {})
    }

    /// Rebuild for the current state with `commit` applied, recording
    /// `commit` only if the batch succeeds.
    fn rebuild(&self, commit: Commit<'_>) -> Result<(), AppError> {
        let mut target = self.require_capabilities()?;
        commit(&mut target);
        let now = unix_now();

        let result = {
            let _guard = lock(&self.apply_lock);
            self.plan_for(&target, now)
                .and_then(|lines| self.run_batch(&lines).map(|()| lines.len()))
        };
        let count = match result {
            Ok(count) => count,
            Err(e) => {
                self.update_state(|s| s.policy_applied = false);
                return Err(e);
            }
        };

        let lapsed = target
            .captive_bypass_uid
            .filter(|_| target.live_captive_uid(now).is_none());
        self.update_state(|s| {
            commit(s);
            s.policy_applied = target.master_enabled;
            if lapsed.is_some() && s.captive_bypass_uid == lapsed {
                s.captive_bypass_uid = None;
                s.captive_bypass_until = None;
            }
        });
        if let Some(uid) = lapsed {
            tracing::info!("Dropped lapsed captive bypass for uid {uid}");
        }
        tracing::info!("Applied full policy ({count} commands)");
        Ok(())
    }

    fn rebuild_with_retry(&self, commit: Commit<'_>) -> Result<(), AppError> {
        match self.rebuild(commit) {
            Err(AppError::CommandFailed(msg)) => {
                tracing::warn!("Full policy apply failed ({msg}); retrying");
                self.rebuild(commit)
            }
            other => other,
        }
    }

    /// After a failed change, rebuild from the recorded state.
    fn recover(&self, e: AppError) -> AppError {
        if matches!(e, AppError::CommandFailed(_)) {
            tracing::error!("Toggle failed, reconciling from scratch: {e}");
            if let Err(recover) = self.apply_with_retry() {
                tracing::error!("Reconciliation after failed toggle failed: {recover}");
            }
        }
        e
    }

    /// The kernel chains cannot be patched in place: they were never built
    /// by this state, or they still hold an exemption whose window lapsed.
    fn needs_rebuild(state: &PolicyState, now: u64) -> bool {
        !state.policy_applied
            || (state.captive_bypass_uid.is_some() && state.live_captive_uid(now).is_none())
    }

    fn reconcile_if_active(&self) -> Result<(), AppError> {
        if self.state().is_active() {
            self.apply_with_retry()
        } else {
            tracing::debug!("Policy inactive; rule change takes effect on next apply");
            Ok(())
        }
    }

    /// Queue a full reconciliation on the policy worker (boot, package change).
    pub fn reconcile_in_background(self: &Arc<Self>) -> mpsc::Receiver<Result<(), AppError>> {
        let engine = Arc::clone(self);
        self.background.submit(move || engine.apply_with_retry())
    }

    // ---- Master switch ----

    /// Enable: rebuild the policy. Disable: flush only, restoring default routing.
    ///
    /// Disabling removes the anonymity guarantee; callers confirm it first.
    pub fn set_master_enabled(&self, enable: bool) -> Result<(), AppError> {
        if enable {
            self.require_capabilities()?;
            if let Err(e) = self.rebuild_with_retry(&|s| s.master_enabled = true) {
                tracing::error!("Enabling policy failed: {e}");
                self.update_state(|s| s.master_enabled = false);
                if let Err(flush_err) = self.apply_full_policy() {
                    tracing::warn!("Flush after failed enable also failed: {flush_err}");
                }
                return Err(e);
            }
            tracing::info!("Policy enabled");
            return Ok(());
        }

        let state = self.update_state(|s| {
            s.master_enabled = false;
            s.policy_applied = false;
        });
        if !(state.root_available && state.filter_binary_present) {
            tracing::warn!("Policy disabled without root or iptables; nothing to flush");
            return Ok(());
        }
        let _guard = lock(&self.apply_lock);
        self.run_batch(&self.ruleset(&state).ensure_and_flush())?;
        tracing::info!("Policy disabled; owned chains flushed");
        Ok(())
    }

    // ---- Toggles ----

    /// Insert or delete one group of rules, then record `commit`.
    ///
    /// Inactive policy only records. Chains that cannot be patched in place
    /// are rebuilt with `commit` applied instead.
    fn apply_toggle<B>(&self, enable: bool, build: B, commit: Commit<'_>) -> Result<(), AppError>
    where
        B: FnOnce(&RuleSet) -> Vec<RuleSpec>,
    {
        let state = self.state();
        if !state.is_active() {
            self.update_state(commit);
            return Ok(());
        }
        let now = unix_now();
        if Self::needs_rebuild(&state, now) {
            tracing::debug!("Owned chains not built for the current state; rebuilding");
            return self.rebuild_with_retry(commit).map_err(|e| self.recover(e));
        }

        let rs = self.ruleset(&state);
        let group = build(&rs);
        let lines = if enable {
            let mut next = state.clone();
            commit(&mut next);
            self.placements(&rs, &next, &group, now)?
        } else {
            group.iter().map(|s| rs.delete(s)).collect()
        };

        let result = {
            let _guard = lock(&self.apply_lock);
            self.run_batch(&lines)
        };
        match result {
            Ok(()) => {
                self.update_state(commit);
                Ok(())
            }
            Err(e) => Err(self.recover(e)),
        }
    }

    /// Insert lines that put each rule of `group` where a full reconciliation
    /// of `next` would place it. Chains hold the plan for `next` minus `group`,
    /// so inserting in ascending position order lands every rule exactly.
    fn placements(
        &self,
        rs: &RuleSet,
        next: &PolicyState,
        group: &[RuleSpec],
        now: u64,
    ) -> Result<Vec<String>, AppError> {
        let planned = self.plan_specs(next, rs, now)?;
        let mut placed = Vec::with_capacity(group.len());
        for spec in group {
            let index = planned
                .iter()
                .filter(|p| p.table == spec.table && p.chain == spec.chain)
                .position(|p| p == spec)
                .ok_or_else(|| {
                    AppError::InvalidInput(format!("rule `{}` is not part of the policy", spec.body))
                })?;
            placed.push((index + 1, spec));
        }
        placed.sort_by_key(|(position, _)| *position);
        Ok(placed
            .into_iter()
            .map(|(position, spec)| rs.insert_at(spec, position))
            .collect())
    }

    /// Exempt `uid` from filtering and redirection for the configured grace
    /// time, or withdraw its exemption.
    ///
    /// At most one uid is exempted; enabling another one removes the first.
    /// Disabling also stops a countdown running for `uid`.
    pub fn toggle_captive_bypass(&self, uid: u32, enable: bool) -> Result<(), AppError> {
        if enable {
            self.exempt(uid, Duration::from_secs(self.config.bypass.grace_minutes * 60))
        } else {
            self.unexempt(uid)
        }
    }

    fn exempt(&self, uid: u32, window: Duration) -> Result<(), AppError> {
        let until = unix_now() + window.as_secs().max(1);
        let current = self.state().captive_bypass_uid;
        if current == Some(uid) {
            self.update_state(|s| s.captive_bypass_until = Some(until));
            tracing::debug!("Captive bypass for uid {uid} extended");
            return Ok(());
        }
        if let Some(other) = current {
            self.unexempt(other)?;
        }
        self.apply_toggle(true, |rs| rs.captive_bypass(uid), &|s| {
            s.captive_bypass_uid = Some(uid);
            s.captive_bypass_until = Some(until);
        })?;
        tracing::info!("Captive bypass on for uid {uid}");
        Ok(())
    }

    fn unexempt(&self, uid: u32) -> Result<(), AppError> {
        if self.scheduler.active().map(|w| w.target_uid) == Some(uid) {
            self.scheduler.cancel();
        }
        if self.state().captive_bypass_uid != Some(uid) {
            return Ok(());
        }
        self.apply_toggle(false, |rs| rs.captive_bypass(uid), &|s| {
            s.captive_bypass_uid = None;
            s.captive_bypass_until = None;
        })?;
        tracing::info!("Captive bypass off for uid {uid}");
        Ok(())
    }

    /// Exempt `uid` for `duration`, then revert automatically.
    ///
    /// The deadline is persisted too, so the exemption lapses even if this
    /// process dies before its countdown runs out.
    pub fn arm_captive_bypass(self: &Arc<Self>, uid: u32, duration: Duration) -> Result<(), AppError> {
        self.exempt(uid, duration)?;

        let engine = Arc::downgrade(self);
        let revert: RevertFn = Arc::new(move |uid| {
            if let Some(engine) = engine.upgrade() {
                if let Err(e) = engine.unexempt(uid) {
                    tracing::error!("Reverting captive bypass for uid {uid} failed: {e}");
                }
            }
        });

        match self.scheduler.start(uid, duration, revert) {
            Ok(Some(previous)) if previous.target_uid != uid => {
                tracing::info!("Bypass for uid {} superseded by uid {uid}", previous.target_uid);
                Ok(())
            }
            Ok(_) => Ok(()),
            Err(e) => {
                self.unexempt(uid)?;
                Err(e)
            }
        }
    }

    /// Withdraw an exemption whose deadline passed without its countdown
    /// reverting it. Returns the uid that was withdrawn.
    pub fn expire_lapsed_bypass(&self) -> Result<Option<u32>, AppError> {
        let state = self.state();
        match state.captive_bypass_uid {
            Some(uid) if state.live_captive_uid(unix_now()).is_none() => {
                tracing::warn!("Captive bypass for uid {uid} outlived its window; withdrawing it");
                self.unexempt(uid)?;
                Ok(Some(uid))
            }
            _ => Ok(None),
        }
    }

    /// Redirect the designated SIP application's datagrams to the overlay proxy.
    pub fn toggle_sip_redirect(&self, uid: u32, enable: bool) -> Result<(), AppError> {
        let state = self.state();
        let current = if state.sip_enabled { state.designated_sip_uid } else { None };
        if enable {
            if current == Some(uid) {
                return Ok(());
            }
            if let Some(other) = current {
                self.toggle_sip_redirect(other, false)?;
            }
            self.apply_toggle(true, |rs| rs.sip_redirect(uid), &|s| {
                s.sip_enabled = true;
                s.designated_sip_uid = Some(uid);
            })?;
            tracing::info!("SIP redirection on for uid {uid}");
            return Ok(());
        }

        if current != Some(uid) {
            return Ok(());
        }
        self.apply_toggle(false, |rs| rs.sip_redirect(uid), &|s| s.sip_enabled = false)?;
        tracing::info!("SIP redirection off for uid {uid}");
        Ok(())
    }

    /// Let private-range destinations bypass redirection.
    pub fn toggle_lan(&self, enable: bool) -> Result<(), AppError> {
        if self.state().lan_bypass_enabled == enable {
            return Ok(());
        }
        self.apply_toggle(enable, |rs| rs.lan_bypass(), &|s| s.lan_bypass_enabled = enable)?;
        tracing::info!("LAN bypass {}", if enable { "enabled" } else { "disabled" });
        Ok(())
    }

    /// Apply forwarding-path rules for tethered clients on the policy worker.
    pub fn toggle_tether(self: &Arc<Self>, enable: bool) -> mpsc::Receiver<Result<(), AppError>> {
        let engine = Arc::clone(self);
        self.background.submit(move || engine.apply_tether(enable))
    }

    fn apply_tether(&self, enable: bool) -> Result<(), AppError> {
        let state = self.state();
        if state.tether_enabled == enable {
            return Ok(());
        }
        let commit = move |s: &mut PolicyState| s.tether_enabled = enable;
        if !state.is_active() {
            self.update_state(commit);
            return Ok(());
        }
        if Self::needs_rebuild(&state, unix_now()) {
            return self.rebuild_with_retry(&commit).map_err(|e| self.recover(e));
        }

        // The tether chains hold nothing else, so flush and append.
        let rs = self.ruleset(&state);
        let mut lines = rs.flush_tether();
        if enable {
            lines.extend(rs.tether().iter().map(|s| rs.append(s)));
        }
        let result = {
            let _guard = lock(&self.apply_lock);
            self.run_batch(&lines)
        };
        match result {
            Ok(()) => {
                self.update_state(commit);
                tracing::info!("Tethering {}", if enable { "enabled" } else { "disabled" });
                Ok(())
            }
            Err(e) => Err(self.recover(e)),
        }
    }

    // ---- Designations ----

    pub fn designate_browser(&self, uid: Option<u32>) -> Result<(), AppError> {
        let state = self.state();
        if let Some(old) = state.designated_browser_uid.filter(|old| Some(*old) != uid) {
            self.unexempt(old)?;
        }
        self.update_state(|s| s.designated_browser_uid = uid);
        Ok(())
    }

    pub fn designate_sip(&self, uid: Option<u32>) -> Result<(), AppError> {
        let state = self.state();
        if let Some(old) = state.designated_sip_uid.filter(|old| Some(*old) != uid) {
            self.toggle_sip_redirect(old, false)?;
        }
        self.update_state(|s| s.designated_sip_uid = uid);
        Ok(())
    }

    // ---- Rule mutations ----

    pub fn add_rule(&self, rule: &AppRule) -> Result<bool, AppError> {
        let inserted = self.store.add(rule)?;
        if inserted {
            tracing::info!("Rule added for {} (uid {})", rule.package_name, rule.uid);
            self.reconcile_if_active()?;
        }
        Ok(inserted)
    }

    pub fn update_rule(&self, rule: &AppRule) -> Result<bool, AppError> {
        let updated = self.store.update(rule)?;
        if updated {
            tracing::info!("Rule updated for uid {}", rule.uid);
            self.reconcile_if_active()?;
        }
        Ok(updated)
    }

    pub fn remove_rule(&self, uid: u32) -> Result<bool, AppError> {
        let removed = self.store.remove(uid)?;
        if removed {
            tracing::info!("Rule removed for uid {uid}");
            self.reconcile_if_active()?;
        }
        Ok(removed)
    }

    pub fn import_legacy(
        &self,
        pairs: &BTreeMap<String, u32>,
        registry: &dyn PackageRegistry,
    ) -> Result<usize, AppError> {
        let imported = self.store.import_legacy(pairs, registry)?;
        if imported > 0 {
            self.reconcile_if_active()?;
        }
        Ok(imported)
    }
}
