//! Reason codes for every degradation path.
//!
//! Nothing degrades silently: each fallback records a [`Reason`] that the
//! caller can dump, in addition to the log line.

/// Maximum number of recorded reasons
pub const MAX_REASONS: usize = 32;

/// Why something was degraded or skipped
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u16)]
pub enum ReasonCode {
    /// Optional working buffer bank did not fit (detail = bank slot)
    BankDropped = 0x01,
    /// Block read failed verification and was retried (detail = attempt)
    CrcRetry = 0x02,
    /// Optional block permanently failed and was waived
    OptionalBlockWaived = 0x03,
    /// Mandatory basic-init block could not be loaded
    MandatoryBlockLost = 0x04,
    /// Block keyed for another chip or resolution
    BlockNotApplicable = 0x05,
    /// Block targets a bank that is not valid
    BankUnavailable = 0x06,
    /// TEE refused protection (detail = TEE status)
    ProtectFailed = 0x07,
    /// TEE refused unprotection (detail = TEE status)
    UnprotectFailed = 0x08,
    /// Feature bit cleared in the basic-init block (detail = feature bit)
    FeatureDisabled = 0x09,
    /// Post-completion hook output was rejected
    ReconcileRejected = 0x0A,
    /// No manifest in the key-value store
    ManifestMissing = 0x0B,
    /// Layout could not satisfy mandatory regions
    LayoutInsufficient = 0x0C,
    /// Activation vetoed by the platform
    ActivationVetoed = 0x0D,
    /// Required auxiliary block failed and stays outstanding
    BlockFailed = 0x0E,
}

impl ReasonCode {
    pub const fn code(&self) -> u16 {
        *self as u16
    }

    pub const fn name(&self) -> &'static str {
        match self {
            ReasonCode::BankDropped => "bank-dropped",
            ReasonCode::CrcRetry => "crc-retry",
            ReasonCode::OptionalBlockWaived => "optional-block-waived",
            ReasonCode::MandatoryBlockLost => "mandatory-block-lost",
            ReasonCode::BlockNotApplicable => "block-not-applicable",
            ReasonCode::BankUnavailable => "bank-unavailable",
            ReasonCode::ProtectFailed => "protect-failed",
            ReasonCode::UnprotectFailed => "unprotect-failed",
            ReasonCode::FeatureDisabled => "feature-disabled",
            ReasonCode::ReconcileRejected => "reconcile-rejected",
            ReasonCode::ManifestMissing => "manifest-missing",
            ReasonCode::LayoutInsufficient => "layout-insufficient",
            ReasonCode::ActivationVetoed => "activation-vetoed",
            ReasonCode::BlockFailed => "block-failed",
        }
    }
}

/// One recorded degradation
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Reason {
    pub code: ReasonCode,
    /// Manifest index of the block concerned, if any
    pub block: Option<u16>,
    /// Code-specific detail value
    pub detail: u32,
}

/// Bounded log of reasons
#[derive(Clone, Debug)]
pub struct ReasonLog {
    entries: [Option<Reason>; MAX_REASONS],
    count: usize,
    /// Reasons that did not fit
    dropped: usize,
}

impl ReasonLog {
    pub const fn new() -> Self {
        Self {
            entries: [None; MAX_REASONS],
            count: 0,
            dropped: 0,
        }
    }

    /// Record a reason. Returns false when the log is full.
    pub fn push(&mut self, code: ReasonCode, block: Option<u16>, detail: u32) -> bool {
        if self.count >= MAX_REASONS {
            self.dropped += 1;
            return false;
        }
        self.entries[self.count] = Some(Reason {
            code,
            block,
            detail,
        });
        self.count += 1;
        true
    }

    pub fn iter(&self) -> impl Iterator<Item = &Reason> {
        self.entries[..self.count].iter().flatten()
    }

    pub fn contains(&self, code: ReasonCode) -> bool {
        self.iter().any(|r| r.code == code)
    }

    pub fn count_of(&self, code: ReasonCode) -> usize {
        self.iter().filter(|r| r.code == code).count()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.count
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn dropped(&self) -> usize {
        self.dropped
    }
}

impl Default for ReasonLog {
    fn default() -> Self {
        Self::new()
    }
}
