//! # Controller Context
//!
//! Owns the whole resource lifecycle of one display output: layout,
//! manifest, loaded blocks, completion, protection records and the reason
//! log. Each output gets its own context; there is no process-wide state.
//!
//! ```text
//! init ──> load_all / load_block ──> protect_secure ──> may_activate
//!                  │                                        │
//!                  └── reload_block (unprotect, load, protect)
//!                                                  release ─┘
//! ```

use alloc::collections::BTreeMap;
use alloc::vec::Vec;
use log::{debug, error, info, warn};

use crate::block::{self, BlockKind, DataBlockHeader};
use crate::completion::{CompletionState, CompletionTracker};
use crate::gate::{self, GateDecision};
use crate::layout::{self, InsufficientMemory, Layout, LayoutPolicy, RegionSizeTable};
use crate::loader::{self, LoadError, LoadTarget, LoadedBlock, StagingCursor};
use crate::manifest::{Manifest, ManifestEntry, MANIFEST_KEY};
use crate::memory::{MemoryError, ReservedMemoryAccess};
use crate::platform::{self, PlatformHooks};
use crate::reason::{Reason, ReasonCode, ReasonLog};
use crate::region::{RegionKind, ReservedMemory, ReservedMemoryRegion, WorkingBufferBank};
use crate::secure::{SecureMemoryCoordinator, SecureProtectionRecord, TeeError, TrustedExecEnv};
use crate::store::SecureKeyStore;
use crate::{ChipId, Resolution};

// ============================================================================
// STATE AND ERRORS
// ============================================================================

/// Why the controller fell back to hardware defaults
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DisableCause {
    Layout(InsufficientMemory),
    Manifest(LoadError),
    /// Basic-init block could not be loaded
    MandatoryBlock(LoadError),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DtcState {
    Uninit,
    Ready,
    Disabled(DisableCause),
    /// All protection dropped; the reserved block may be handed back
    Released,
}

impl DtcState {
    pub const fn name(&self) -> &'static str {
        match self {
            DtcState::Uninit => "uninit",
            DtcState::Ready => "ready",
            DtcState::Disabled(_) => "disabled",
            DtcState::Released => "released",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DtcError {
    Layout(InsufficientMemory),
    Load { index: Option<u16>, error: LoadError },
    Tee(TeeError),
    Memory(MemoryError),
    /// Operation needs a context in the ready state
    NotReady(&'static str),
    UnknownBlock(u16),
    /// Gate refused activation
    Gate(GateDecision),
}

impl core::fmt::Display for DtcError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            DtcError::Layout(e) => write!(f, "{}", e),
            DtcError::Load { index: Some(i), error } => write!(f, "block {}: {}", i, error),
            DtcError::Load { index: None, error } => write!(f, "{}", error),
            DtcError::Tee(e) => write!(f, "{}", e),
            DtcError::Memory(e) => write!(f, "{}", e),
            DtcError::NotReady(state) => write!(f, "controller is {}", state),
            DtcError::UnknownBlock(i) => write!(f, "no manifest entry with index {}", i),
            DtcError::Gate(d) => write!(f, "activation refused: {:?}", d),
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for DtcError {}

impl From<TeeError> for DtcError {
    fn from(e: TeeError) -> Self {
        DtcError::Tee(e)
    }
}

impl From<MemoryError> for DtcError {
    fn from(e: MemoryError) -> Self {
        DtcError::Memory(e)
    }
}

pub type DtcResult<T> = Result<T, DtcError>;

// ============================================================================
// DIAGNOSTICS
// ============================================================================

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlockSummary {
    pub index: u16,
    pub name: alloc::string::String,
    pub kind: BlockKind,
    pub attempts: u32,
    pub payload_len: usize,
    pub staged: Option<(u64, u32)>,
    pub target: Option<&'static str>,
    pub preprocessed: bool,
}

/// Snapshot backing the diagnostic dump
#[derive(Clone, Debug)]
pub struct Diagnostics {
    pub chip: ChipId,
    pub panel: Resolution,
    pub state: DtcState,
    pub reserved: ReservedMemory,
    pub policy: Option<LayoutPolicy>,
    pub manifest_version: Option<u32>,
    pub regions: Vec<ReservedMemoryRegion>,
    pub banks: Vec<WorkingBufferBank>,
    pub completion: Option<CompletionState>,
    pub blocks: Vec<BlockSummary>,
    pub protection: Vec<SecureProtectionRecord>,
    pub reasons: Vec<Reason>,
    pub reasons_dropped: usize,
}

// ============================================================================
// CONTEXT
// ============================================================================

pub struct DtcContext<H: PlatformHooks> {
    chip: ChipId,
    panel: Resolution,
    hooks: H,
    reserved: ReservedMemory,
    table: RegionSizeTable,
    layout: Option<Layout>,
    manifest: Option<Manifest>,
    tracker: Option<CompletionTracker>,
    staging: Option<StagingCursor>,
    secure: SecureMemoryCoordinator,
    loaded: BTreeMap<u16, LoadedBlock>,
    reasons: ReasonLog,
    state: DtcState,
}

impl<H: PlatformHooks> DtcContext<H> {
    pub fn new(
        chip: ChipId,
        panel: Resolution,
        reserved: ReservedMemory,
        table: RegionSizeTable,
        hooks: H,
    ) -> Self {
        Self {
            chip,
            panel,
            hooks,
            reserved,
            table,
            layout: None,
            manifest: None,
            tracker: None,
            staging: None,
            secure: SecureMemoryCoordinator::new(None),
            loaded: BTreeMap::new(),
            reasons: ReasonLog::new(),
            state: DtcState::Uninit,
        }
    }

    // ------------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------------

    pub fn state(&self) -> DtcState {
        self.state
    }

    pub fn chip(&self) -> &ChipId {
        &self.chip
    }

    pub fn layout(&self) -> Option<&Layout> {
        self.layout.as_ref()
    }

    pub fn manifest(&self) -> Option<&Manifest> {
        self.manifest.as_ref()
    }

    pub fn completion(&self) -> Option<&CompletionState> {
        self.tracker.as_ref().map(|t| t.state())
    }

    pub fn reasons(&self) -> &ReasonLog {
        &self.reasons
    }

    pub fn loaded_block(&self, index: u16) -> Option<&LoadedBlock> {
        self.loaded.get(&index)
    }

    pub fn protection(&self, kind: RegionKind) -> Option<&SecureProtectionRecord> {
        self.secure.record(kind)
    }

    fn disable(&mut self, cause: DisableCause) {
        error!("dtc: controller disabled: {:?}", cause);
        self.state = DtcState::Disabled(cause);
    }

    fn require_ready(&self) -> DtcResult<()> {
        match self.state {
            DtcState::Ready => Ok(()),
            other => Err(DtcError::NotReady(other.name())),
        }
    }

    // ------------------------------------------------------------------------
    // Initialization
    // ------------------------------------------------------------------------

    /// Plan the layout and read the manifest.
    ///
    /// The manifest is copied to the start of the staging buffer, which is
    /// placed in the provisional layout; its version is then read back from
    /// there to pick the layout policy before the layout is finalized.
    ///
    /// Any failure disables this controller only.
    pub fn init<S, M>(&mut self, store: &mut S, mem: &mut M) -> DtcResult<()>
    where
        S: SecureKeyStore,
        M: ReservedMemoryAccess,
    {
        if self.state != DtcState::Uninit {
            return Err(DtcError::NotReady(self.state.name()));
        }

        let provisional = match layout::provisional(self.reserved, &self.table) {
            Ok(p) => p,
            Err(e) => return Err(self.fail_layout(e)),
        };

        if !store.exists(MANIFEST_KEY) {
            self.reasons.push(ReasonCode::ManifestMissing, None, 0);
            let error = LoadError::Store(crate::store::StoreError::NotFound);
            self.disable(DisableCause::Manifest(error));
            return Err(DtcError::Load { index: None, error });
        }
        let raw = match loader::read_manifest(store, &mut self.reasons) {
            Ok((raw, _)) => raw,
            Err(error) => {
                self.disable(DisableCause::Manifest(error));
                return Err(DtcError::Load { index: None, error });
            }
        };

        let staging = *provisional.staging();
        if raw.len() as u64 > loader::STAGING_DATA_OFFSET || staging.size as u64 <= loader::STAGING_DATA_OFFSET {
            let error = LoadError::TooLarge {
                len: raw.len(),
                capacity: loader::STAGING_DATA_OFFSET as u32,
            };
            self.disable(DisableCause::Manifest(error));
            return Err(DtcError::Load { index: None, error });
        }
        mem.write(staging.physical_base, &raw)?;

        // Policy comes from the staged copy, not the store read
        let mut staged = alloc::vec![0u8; raw.len()];
        mem.read(staging.physical_base, &mut staged)?;
        let manifest = match Manifest::decode(&staged) {
            Ok(m) => m,
            Err(e) => {
                let error = LoadError::Manifest(e);
                self.disable(DisableCause::Manifest(error));
                return Err(DtcError::Load { index: None, error });
            }
        };
        let policy = manifest.policy();
        debug!(
            "dtc: manifest v{} with {} blocks, {} layout",
            manifest.version,
            manifest.block_count(),
            policy.name()
        );

        let layout = match provisional.finalize(policy) {
            Ok(l) => l,
            Err(e) => return Err(self.fail_layout(e)),
        };
        for bank in layout.dropped_banks() {
            self.reasons
                .push(ReasonCode::BankDropped, None, bank.mem_type.slot() as u32);
        }

        self.secure = SecureMemoryCoordinator::new(layout.secure_status().copied());
        self.secure.init_mirror(mem);
        // Manifest entry count is bounded below the bitmap width
        self.tracker = CompletionTracker::new(manifest.block_count());
        self.staging = Some(StagingCursor::new(staging));
        self.layout = Some(layout);
        self.manifest = Some(manifest);
        self.state = DtcState::Ready;

        info!(
            "dtc: {} ready, {} layout",
            self.chip.family.name(),
            policy.name()
        );
        Ok(())
    }

    fn fail_layout(&mut self, e: InsufficientMemory) -> DtcError {
        self.reasons.push(
            ReasonCode::LayoutInsufficient,
            None,
            e.required.min(u32::MAX as u64) as u32,
        );
        self.disable(DisableCause::Layout(e));
        DtcError::Layout(e)
    }

    // ------------------------------------------------------------------------
    // Loading
    // ------------------------------------------------------------------------

    /// Load every block that has not arrived yet.
    ///
    /// Fails only when the basic-init block is lost, which disables the
    /// controller. Optional blocks that fail are waived; required auxiliary
    /// blocks that fail stay outstanding until reloaded.
    pub fn load_all<S, M>(&mut self, store: &mut S, mem: &mut M) -> DtcResult<CompletionState>
    where
        S: SecureKeyStore,
        M: ReservedMemoryAccess,
    {
        self.require_ready()?;
        let pending: Vec<u16> = match (&self.manifest, &self.tracker) {
            (Some(m), Some(t)) => m
                .entries
                .iter()
                .map(|e| e.index)
                .filter(|&i| !t.state().arrived(i as usize))
                .collect(),
            _ => return Err(DtcError::NotReady(self.state.name())),
        };

        // Basic-init first so a lost mandatory block stops early
        let (init, rest): (Vec<u16>, Vec<u16>) = pending.into_iter().partition(|&i| {
            self.manifest
                .as_ref()
                .and_then(|m| m.entry(i))
                .map_or(false, |e| e.kind == BlockKind::BasicInit)
        });
        for index in init.into_iter().chain(rest) {
            match self.load_entry(index, store, mem) {
                Ok(_) => {}
                Err(e) if self.state == DtcState::Ready => {
                    debug!("dtc: block {} left outstanding: {}", index, e)
                }
                Err(e) => return Err(e),
            }
        }
        self.completion_state()
    }

    /// Load a single block by manifest index
    pub fn load_block<S, M>(&mut self, index: u16, store: &mut S, mem: &mut M) -> DtcResult<CompletionState>
    where
        S: SecureKeyStore,
        M: ReservedMemoryAccess,
    {
        self.require_ready()?;
        self.load_entry(index, store, mem)
    }

    fn completion_state(&self) -> DtcResult<CompletionState> {
        self.tracker
            .as_ref()
            .map(|t| *t.state())
            .ok_or(DtcError::NotReady(self.state.name()))
    }

    fn load_entry<S, M>(&mut self, index: u16, store: &mut S, mem: &mut M) -> DtcResult<CompletionState>
    where
        S: SecureKeyStore,
        M: ReservedMemoryAccess,
    {
        let entry: ManifestEntry = self
            .manifest
            .as_ref()
            .and_then(|m| m.entry(index))
            .cloned()
            .ok_or(DtcError::UnknownBlock(index))?;
        let (layout, staging, tracker) = match (&self.layout, &mut self.staging, &mut self.tracker) {
            (Some(l), Some(s), Some(t)) => (l, s, t),
            _ => return Err(DtcError::NotReady(self.state.name())),
        };

        let target = LoadTarget {
            layout,
            chip: &self.chip,
            panel: self.panel,
            hooks: &self.hooks,
        };
        let result = loader::load_block(store, mem, &target, staging, &entry, &mut self.reasons);

        match result {
            Ok(loaded) => {
                tracker.mark_arrived(index as usize);
                self.loaded.insert(index, loaded);
            }
            Err(error) => {
                let reason = match error {
                    LoadError::NotApplicable => ReasonCode::BlockNotApplicable,
                    LoadError::BankUnavailable(_) => ReasonCode::BankUnavailable,
                    _ if entry.kind.is_mandatory() => ReasonCode::MandatoryBlockLost,
                    _ if entry.is_optional() => ReasonCode::OptionalBlockWaived,
                    _ => ReasonCode::BlockFailed,
                };
                self.reasons.push(reason, Some(index), 0);

                if entry.kind.is_mandatory() {
                    if reason != ReasonCode::MandatoryBlockLost {
                        self.reasons
                            .push(ReasonCode::MandatoryBlockLost, Some(index), 0);
                    }
                    self.disable(DisableCause::MandatoryBlock(error));
                } else if entry.is_optional() {
                    if reason != ReasonCode::OptionalBlockWaived {
                        self.reasons
                            .push(ReasonCode::OptionalBlockWaived, Some(index), 0);
                    }
                    if let Err(e) = tracker.waive(index as usize, entry.kind) {
                        debug!("dtc: block {} not waived: {}", index, e);
                    }
                } else {
                    warn!("dtc: required block {} ({}) failed: {}", index, entry.name, error);
                }

                self.after_update(mem);
                return Err(DtcError::Load {
                    index: Some(index),
                    error,
                });
            }
        }

        self.after_update(mem);
        self.completion_state()
    }

    /// Run the post-completion hook on the false -> true transition
    fn after_update<M: ReservedMemoryAccess>(&mut self, mem: &mut M) {
        let fired = self
            .tracker
            .as_mut()
            .map_or(false, |t| t.take_completion_event());
        if fired && self.state == DtcState::Ready {
            self.reconcile(mem);
        }
    }

    fn reconcile<M: ReservedMemoryAccess>(&mut self, mem: &mut M) {
        let Some(state) = self.completion_state().ok() else {
            return;
        };
        let Some(init) = self
            .loaded
            .values_mut()
            .find(|b| b.header.block_kind == BlockKind::BasicInit)
        else {
            return;
        };
        let Some(staged) = init.staged else {
            return;
        };

        let (header, payload) = match loader::read_staged(mem, staged) {
            Ok(v) => v,
            Err(e) => {
                warn!("dtc: staged basic-init failed re-verification: {}", e);
                self.reasons
                    .push(ReasonCode::ReconcileRejected, Some(init.index), 0);
                return;
            }
        };
        let Some(patched) = self.hooks.reconcile(&self.chip, &state, &header, &payload) else {
            return;
        };
        if patched.len() != payload.len() {
            warn!(
                "dtc: reconcile changed basic-init length {} -> {}, ignored",
                payload.len(),
                patched.len()
            );
            self.reasons
                .push(ReasonCode::ReconcileRejected, Some(init.index), patched.len() as u32);
            return;
        }

        // Fresh encode: the checksum always matches the rewritten payload
        let (sealed, bytes) = match block::seal(&header, &patched) {
            Ok(v) => v,
            Err(e) => {
                warn!("dtc: reconcile re-encode failed: {}", e);
                self.reasons
                    .push(ReasonCode::ReconcileRejected, Some(init.index), 0);
                return;
            }
        };
        // Store values may carry trailing bytes past the aligned encoding;
        // the slot keeps its length and anything past the new block is zeroed
        let len = bytes.len().min(staged.1 as usize);
        let mut slot = alloc::vec![0u8; staged.1 as usize];
        slot[..len].copy_from_slice(&bytes[..len]);
        if let Err(e) = mem.write(staged.0, &slot) {
            warn!("dtc: reconcile write failed: {}", e);
            self.reasons
                .push(ReasonCode::ReconcileRejected, Some(init.index), 0);
            return;
        }

        let before = platform::feature_bits(&payload).unwrap_or(0);
        let after = platform::feature_bits(&patched).unwrap_or(0);
        info!("dtc: basic-init reconciled, features {:#x} -> {:#x}", before, after);
        self.reasons
            .push(ReasonCode::FeatureDisabled, Some(init.index), before & !after);
        init.header = sealed;
    }

    // ------------------------------------------------------------------------
    // Protection
    // ------------------------------------------------------------------------

    /// Protect every valid bank fed by a secure block.
    ///
    /// Refusals are recorded and leave the bank usable unprotected. Returns
    /// the number of protected banks.
    pub fn protect_secure<T, M>(&mut self, tee: &mut T, mem: &mut M) -> DtcResult<usize>
    where
        T: TrustedExecEnv,
        M: ReservedMemoryAccess,
    {
        self.require_ready()?;
        let targets = self.secure_targets();
        let mut protected = 0;
        for (index, region) in targets {
            match self.secure.protect(&region, tee, mem) {
                Ok(_) => protected += 1,
                Err(e) => {
                    self.reasons
                        .push(ReasonCode::ProtectFailed, Some(index), e.code());
                }
            }
        }
        Ok(protected)
    }

    /// Working buffers that secure blocks were loaded into
    fn secure_targets(&self) -> Vec<(u16, ReservedMemoryRegion)> {
        let Some(manifest) = &self.manifest else {
            return Vec::new();
        };
        self.loaded
            .values()
            .filter_map(|b| {
                let entry = manifest.entry(b.index)?;
                let region = b.target?;
                let is_bank = matches!(region.kind, RegionKind::WorkingBuffer(_));
                if b.wants_protection(entry) && !is_bank {
                    debug!("dtc: secure block {} not in a bank, not protected", b.index);
                }
                (b.wants_protection(entry) && is_bank).then_some((b.index, region))
            })
            .collect()
    }

    /// Reload one block. A protected destination is unprotected first and
    /// protected again once the new contents are in place.
    pub fn reload_block<S, T, M>(
        &mut self,
        index: u16,
        store: &mut S,
        tee: &mut T,
        mem: &mut M,
    ) -> DtcResult<CompletionState>
    where
        S: SecureKeyStore,
        T: TrustedExecEnv,
        M: ReservedMemoryAccess,
    {
        self.require_ready()?;
        let protected_region = self
            .loaded
            .get(&index)
            .and_then(|b| b.target)
            .filter(|r| self.secure.record(r.kind).map_or(false, |rec| rec.protected));

        if let Some(region) = protected_region {
            if let Err(e) = self.secure.unprotect(region.kind, tee, mem) {
                self.reasons
                    .push(ReasonCode::UnprotectFailed, Some(index), e.code());
                return Err(e.into());
            }
        }

        let result = self.load_entry(index, store, mem);

        if let Some(region) = protected_region {
            // Reprotect even if the reload failed: old contents are still there
            if let Err(e) = self.secure.protect(&region, tee, mem) {
                self.reasons
                    .push(ReasonCode::ProtectFailed, Some(index), e.code());
            }
        }
        result
    }

    /// Drop every protection. The reserved block counts as released only
    /// when this succeeds.
    pub fn release<T, M>(&mut self, tee: &mut T, mem: &mut M) -> DtcResult<()>
    where
        T: TrustedExecEnv,
        M: ReservedMemoryAccess,
    {
        if let Err(e) = self.secure.unprotect_all(tee, mem) {
            self.reasons
                .push(ReasonCode::UnprotectFailed, None, e.code());
            return Err(e.into());
        }
        info!("dtc: {} released", self.chip.family.name());
        self.state = DtcState::Released;
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Activation
    // ------------------------------------------------------------------------

    /// Gate decision for the current state, recomputed on every call
    pub fn gate(&self) -> GateDecision {
        let (Some(tracker), Some(layout)) = (&self.tracker, &self.layout) else {
            return GateDecision::NotComplete;
        };
        if self.state != DtcState::Ready {
            return GateDecision::NotComplete;
        }
        gate::evaluate(Some(&self.hooks), &self.chip, tracker.state(), &layout.banks)
    }

    pub fn may_activate(&self) -> bool {
        self.gate() == GateDecision::Allow
    }

    /// Re-verified basic-init block for the timing logic, if the gate allows
    pub fn activate<M: ReservedMemoryAccess>(&mut self, mem: &M) -> DtcResult<(DataBlockHeader, Vec<u8>)> {
        let decision = self.gate();
        if decision != GateDecision::Allow {
            if decision == GateDecision::Vetoed {
                self.reasons.push(ReasonCode::ActivationVetoed, None, 0);
            }
            return Err(DtcError::Gate(decision));
        }
        let staged = self
            .loaded
            .values()
            .find(|b| b.header.block_kind == BlockKind::BasicInit)
            .and_then(|b| b.staged)
            .ok_or(DtcError::Gate(GateDecision::NotComplete))?;
        loader::read_staged(mem, staged).map_err(|error| DtcError::Load { index: None, error })
    }

    // ------------------------------------------------------------------------
    // Diagnostics
    // ------------------------------------------------------------------------

    pub fn diagnostics(&self) -> Diagnostics {
        let blocks = self
            .loaded
            .values()
            .map(|b| BlockSummary {
                index: b.index,
                name: b.header.name.clone(),
                kind: b.header.block_kind,
                attempts: b.attempts,
                payload_len: b.header.payload_len(),
                staged: b.staged,
                target: b.target.map(|r| r.name),
                preprocessed: b.header.control_flags & block::ctrl::PREPROCESSED != 0,
            })
            .collect();

        Diagnostics {
            chip: self.chip,
            panel: self.panel,
            state: self.state,
            reserved: self.reserved,
            policy: self.layout.as_ref().map(|l| l.policy),
            manifest_version: self.manifest.as_ref().map(|m| m.version),
            regions: self.layout.as_ref().map(|l| l.regions.clone()).unwrap_or_default(),
            banks: self.layout.as_ref().map(|l| l.banks.clone()).unwrap_or_default(),
            completion: self.completion().copied(),
            blocks,
            protection: self.secure.records().copied().collect(),
            reasons: self.reasons.iter().copied().collect(),
            reasons_dropped: self.reasons.dropped(),
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::{ctrl, encode};
    use crate::layout::BankSpec;
    use crate::loader::MAX_READ_RETRIES;
    use crate::manifest::ManifestEntry;
    use crate::memory::RamImage;
    use crate::platform::{feature_bits, init_payload, BuiltinHooks, NoHooks, FEATURE_DEMURA, FEATURE_OD};
    use crate::region::BankType;
    use crate::secure::{read_status, SimulatedTee};
    use crate::store::MemoryKeyStore;
    use crate::{ChipFamily, CoreFlags};

    const KB: u32 = 1024;
    const BASE: u64 = 0x3F00_0000;
    const FHD: Resolution = Resolution::new(1920, 1080);

    fn table() -> RegionSizeTable {
        RegionSizeTable {
            banks: vec![
                BankSpec::mandatory(BankType::Overdrive, 64 * KB),
                BankSpec::optional(BankType::Demura, 32 * KB),
            ],
            staging_size: 64 * KB,
            secure_status_size: 0x1000,
        }
    }

    fn chip(revision: u8) -> ChipId {
        ChipId::new(ChipFamily::T5w, revision, CoreFlags::OD.union(CoreFlags::DEMURA))
    }

    fn populate(store: &mut MemoryKeyStore, version: u32) {
        let manifest = Manifest::new(
            version,
            vec![
                ManifestEntry::new(0, BlockKind::BasicInit, "init"),
                ManifestEntry::new(1, BlockKind::OdLut, "od"),
                ManifestEntry::new(2, BlockKind::DemuraLut, "demura").optional(),
            ],
        )
        .unwrap();
        store.insert(MANIFEST_KEY, manifest.encode().unwrap());

        let init = DataBlockHeader::new(BlockKind::BasicInit, "init").with_resolution(FHD);
        let payload = init_payload(FEATURE_OD | FEATURE_DEMURA, &[(0x100, 1)]);
        store.insert("init", encode(&init, &payload).unwrap());

        let od = DataBlockHeader::new(BlockKind::OdLut, "od").with_flags(ctrl::SECURE);
        store.insert("od", encode(&od, &[0x0D; 256]).unwrap());

        let demura = DataBlockHeader::new(BlockKind::DemuraLut, "demura").with_flags(ctrl::SECURE);
        store.insert("demura", encode(&demura, &[0xDE; 128]).unwrap());
    }

    fn context<H: PlatformHooks>(size: u32, revision: u8, hooks: H) -> (DtcContext<H>, RamImage) {
        let reserved = ReservedMemory::new(BASE, size);
        let ctx = DtcContext::new(chip(revision), FHD, reserved, table(), hooks);
        (ctx, RamImage::new(reserved))
    }

    #[test]
    fn test_full_lifecycle() {
        let mut store = MemoryKeyStore::new();
        populate(&mut store, 1);
        let mut tee = SimulatedTee::new();
        let (mut ctx, mut ram) = context(256 * KB, 1, BuiltinHooks);

        ctx.init(&mut store, &mut ram).unwrap();
        assert_eq!(ctx.layout().unwrap().policy, LayoutPolicy::TableDriven);
        assert!(!ctx.may_activate());

        let state = ctx.load_all(&mut store, &mut ram).unwrap();
        assert!(state.complete);
        assert!(!state.is_degraded());

        assert_eq!(ctx.protect_secure(&mut tee, &mut ram).unwrap(), 2);
        let status = *ctx.layout().unwrap().secure_status().unwrap();
        let view = read_status(&ram, &status).unwrap();
        assert!(view.slots[BankType::Overdrive.slot()].protected);
        assert!(view.slots[BankType::Demura.slot()].protected);

        assert!(ctx.may_activate());
        let (header, payload) = ctx.activate(&ram).unwrap();
        assert_eq!(header.block_kind, BlockKind::BasicInit);
        assert_eq!(feature_bits(&payload), Some(FEATURE_OD | FEATURE_DEMURA));

        ctx.release(&mut tee, &mut ram).unwrap();
        assert_eq!(ctx.state(), DtcState::Released);
        assert_eq!(tee.protected_ranges().count(), 0);
        assert!(!ctx.may_activate());
    }

    #[test]
    fn test_insufficient_memory_disables_controller() {
        let mut store = MemoryKeyStore::new();
        populate(&mut store, 1);
        let (mut ctx, mut ram) = context(100 * KB, 1, NoHooks);

        assert!(matches!(ctx.init(&mut store, &mut ram), Err(DtcError::Layout(_))));
        assert!(matches!(ctx.state(), DtcState::Disabled(DisableCause::Layout(_))));
        assert!(ctx.reasons().contains(ReasonCode::LayoutInsufficient));
        assert!(ctx.load_all(&mut store, &mut ram).is_err());
    }

    #[test]
    fn test_missing_manifest() {
        let mut store = MemoryKeyStore::new();
        let (mut ctx, mut ram) = context(256 * KB, 1, NoHooks);
        assert!(ctx.init(&mut store, &mut ram).is_err());
        assert!(ctx.reasons().contains(ReasonCode::ManifestMissing));
    }

    #[test]
    fn test_dropped_bank_waives_optional_block_and_reconciles() {
        let mut store = MemoryKeyStore::new();
        populate(&mut store, 1);
        // 64K + 64K + 4K mandatory, no room for the 32K demura bank
        let (mut ctx, mut ram) = context(140 * KB, 1, BuiltinHooks);

        ctx.init(&mut store, &mut ram).unwrap();
        assert!(ctx.reasons().contains(ReasonCode::BankDropped));

        let state = ctx.load_all(&mut store, &mut ram).unwrap();
        assert!(state.complete);
        assert!(state.waived(2));
        assert_eq!(state.degraded(BlockKind::DemuraLut), 1);
        assert!(ctx.reasons().contains(ReasonCode::BankUnavailable));
        assert!(ctx.reasons().contains(ReasonCode::OptionalBlockWaived));
        assert!(ctx.reasons().contains(ReasonCode::FeatureDisabled));

        // Basic-init re-encoded with the demura feature cleared
        let (_, payload) = ctx.activate(&ram).unwrap();
        assert_eq!(feature_bits(&payload), Some(FEATURE_OD));
    }

    #[test]
    fn test_reconcile_keeps_trailing_bytes_in_slot() {
        let mut store = MemoryKeyStore::new();
        populate(&mut store, 1);
        let init = DataBlockHeader::new(BlockKind::BasicInit, "init").with_resolution(FHD);
        let payload = init_payload(FEATURE_OD | FEATURE_DEMURA, &[(0x100, 1)]);
        let mut raw = encode(&init, &payload).unwrap();
        raw.extend_from_slice(&[0u8; 64]);
        store.insert("init", raw);
        let (mut ctx, mut ram) = context(140 * KB, 1, BuiltinHooks);

        ctx.init(&mut store, &mut ram).unwrap();
        let state = ctx.load_all(&mut store, &mut ram).unwrap();
        assert!(state.complete);
        assert!(state.waived(2));
        assert!(ctx.reasons().contains(ReasonCode::FeatureDisabled));
        assert!(!ctx.reasons().contains(ReasonCode::ReconcileRejected));

        let (_, payload) = ctx.activate(&ram).unwrap();
        assert_eq!(feature_bits(&payload), Some(FEATURE_OD));
    }

    #[test]
    fn test_mandatory_block_lost() {
        let mut store = MemoryKeyStore::new();
        populate(&mut store, 1);
        store.corrupt_next_reads("init", MAX_READ_RETRIES);
        let (mut ctx, mut ram) = context(256 * KB, 1, NoHooks);

        ctx.init(&mut store, &mut ram).unwrap();
        let err = ctx.load_all(&mut store, &mut ram).unwrap_err();
        assert!(matches!(err, DtcError::Load { index: Some(0), .. }));
        assert!(matches!(
            ctx.state(),
            DtcState::Disabled(DisableCause::MandatoryBlock(_))
        ));
        assert!(ctx.reasons().contains(ReasonCode::MandatoryBlockLost));
        assert_eq!(ctx.reasons().count_of(ReasonCode::CrcRetry), 2);
        assert!(!ctx.may_activate());
    }

    #[test]
    fn test_required_block_stays_outstanding_until_reload() {
        let mut store = MemoryKeyStore::new();
        populate(&mut store, 1);
        store.corrupt_next_reads("od", MAX_READ_RETRIES);
        let mut tee = SimulatedTee::new();
        let (mut ctx, mut ram) = context(256 * KB, 1, NoHooks);

        ctx.init(&mut store, &mut ram).unwrap();
        let state = ctx.load_all(&mut store, &mut ram).unwrap();
        assert!(!state.complete);
        assert!(ctx.reasons().contains(ReasonCode::BlockFailed));
        assert!(!ctx.may_activate());

        let state = ctx.reload_block(1, &mut store, &mut tee, &mut ram).unwrap();
        assert!(state.complete);
        assert!(ctx.may_activate());
    }

    #[test]
    fn test_reload_reprotects() {
        let mut store = MemoryKeyStore::new();
        populate(&mut store, 1);
        let mut tee = SimulatedTee::new();
        let (mut ctx, mut ram) = context(256 * KB, 1, NoHooks);

        ctx.init(&mut store, &mut ram).unwrap();
        ctx.load_all(&mut store, &mut ram).unwrap();
        ctx.protect_secure(&mut tee, &mut ram).unwrap();
        let kind = RegionKind::WorkingBuffer(BankType::Overdrive);
        let before = ctx.protection(kind).unwrap().handle;

        let od = DataBlockHeader::new(BlockKind::OdLut, "od").with_flags(ctrl::SECURE);
        store.insert("od", encode(&od, &[0x5A; 256]).unwrap());
        ctx.reload_block(1, &mut store, &mut tee, &mut ram).unwrap();

        let record = ctx.protection(kind).unwrap();
        assert!(record.protected);
        assert_ne!(record.handle, before);
        assert_eq!(tee.unprotect_calls, 1);

        let bank = ctx.layout().unwrap().bank(BankType::Overdrive).unwrap();
        let mut first = [0u8; 2];
        ram.read(bank.region.unwrap().physical_base, &mut first).unwrap();
        assert_eq!(first, [0x5A, 0x5A]);
    }

    #[test]
    fn test_protect_failure_is_not_fatal() {
        let mut store = MemoryKeyStore::new();
        populate(&mut store, 1);
        let mut tee = SimulatedTee::absent();
        let (mut ctx, mut ram) = context(256 * KB, 1, NoHooks);

        ctx.init(&mut store, &mut ram).unwrap();
        ctx.load_all(&mut store, &mut ram).unwrap();
        assert_eq!(ctx.protect_secure(&mut tee, &mut ram).unwrap(), 0);
        assert_eq!(ctx.reasons().count_of(ReasonCode::ProtectFailed), 2);
        assert!(ctx.may_activate());
    }

    #[test]
    fn test_platform_veto() {
        let mut store = MemoryKeyStore::new();
        populate(&mut store, 1);
        let (mut ctx, mut ram) = context(256 * KB, 0, BuiltinHooks);

        ctx.init(&mut store, &mut ram).unwrap();
        ctx.load_all(&mut store, &mut ram).unwrap();
        assert_eq!(ctx.gate(), GateDecision::Vetoed);
        assert_eq!(ctx.activate(&ram).unwrap_err(), DtcError::Gate(GateDecision::Vetoed));
        assert!(ctx.reasons().contains(ReasonCode::ActivationVetoed));
    }

    #[test]
    fn test_legacy_layout_places_luts() {
        let mut store = MemoryKeyStore::new();
        populate(&mut store, 0);
        // Banks + staging + legacy buffers
        let (mut ctx, mut ram) = context(2 * 1024 * KB, 1, NoHooks);

        ctx.init(&mut store, &mut ram).unwrap();
        assert_eq!(ctx.layout().unwrap().policy, LayoutPolicy::LegacyFixed);
        assert!(ctx.layout().unwrap().secure_status().is_none());

        ctx.load_all(&mut store, &mut ram).unwrap();
        let demura = ctx.loaded_block(2).unwrap();
        assert_eq!(
            demura.target.unwrap().kind,
            RegionKind::LegacyLut(crate::region::LegacyLutType::DemuraLut)
        );
    }

    #[test]
    fn test_diagnostics_snapshot() {
        let mut store = MemoryKeyStore::new();
        populate(&mut store, 1);
        store.corrupt_next_reads("od", 1);
        let (mut ctx, mut ram) = context(256 * KB, 1, NoHooks);

        ctx.init(&mut store, &mut ram).unwrap();
        ctx.load_all(&mut store, &mut ram).unwrap();
        let diag = ctx.diagnostics();

        assert_eq!(diag.state, DtcState::Ready);
        assert_eq!(diag.manifest_version, Some(1));
        assert_eq!(diag.blocks.len(), 3);
        let od = diag.blocks.iter().find(|b| b.kind == BlockKind::OdLut).unwrap();
        assert_eq!(od.attempts, 2);
        assert_eq!(od.target, Some("overdrive"));
        assert!(diag.reasons.iter().any(|r| r.code == ReasonCode::CrcRetry && r.block == Some(1)));
    }
}
