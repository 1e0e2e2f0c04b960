//! Quota presets and promo-code grants.

use std::{
    collections::HashMap,
    sync::{Mutex, MutexGuard, PoisonError, RwLock},
};

use {
    rand::Rng,
    serde::{Deserialize, Serialize},
    tracing::{debug, info},
};

use crate::error::{Error, Result};

/// Alphabet promo codes are drawn from.
const CODE_ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";
/// Length of every promo code.
pub const CODE_LEN: usize = 6;

/// CPU/RAM/disk allotment granted to one instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaSpec {
    pub ram_gib: u32,
    pub cpu_cores: u32,
    pub disk_gib: u32,
    /// Size of the secondary disk; zero means no secondary disk.
    pub secondary_disk_gib: u32,
}

impl QuotaSpec {
    #[must_use]
    pub fn new(ram_gib: u32, cpu_cores: u32, disk_gib: u32, secondary_disk_gib: u32) -> Self {
        Self {
            ram_gib,
            cpu_cores,
            disk_gib,
            secondary_disk_gib,
        }
    }

    /// Reject zero RAM, CPU or primary disk. Never clamps.
    pub fn validate(&self) -> Result<()> {
        for (field, value) in [
            ("ram_gib", self.ram_gib),
            ("cpu_cores", self.cpu_cores),
            ("disk_gib", self.disk_gib),
        ] {
            if value == 0 {
                return Err(Error::InvalidQuota(format!(
                    "{field} must be greater than zero"
                )));
            }
        }
        Ok(())
    }

    /// Parse `ram cpu disk disk2` command arguments.
    pub fn from_args(args: &[&str]) -> Result<Self> {
        let [ram, cpu, disk, disk2] = args else {
            return Err(Error::InvalidQuota(format!(
                "expected 4 values (ram cpu disk disk2), got {}",
                args.len()
            )));
        };
        let parse = |name: &str, raw: &str| {
            raw.parse::<u32>()
                .map_err(|_| Error::InvalidQuota(format!("{name} must be a whole number, got '{raw}'")))
        };
        let spec = Self::new(
            parse("ram", *ram)?,
            parse("cpu", *cpu)?,
            parse("disk", *disk)?,
            parse("disk2", *disk2)?,
        );
        spec.validate()?;
        Ok(spec)
    }

    /// Compact `ram,cpu,disk,disk2` form stored in container labels.
    #[must_use]
    pub fn to_label(&self) -> String {
        format!(
            "{},{},{},{}",
            self.ram_gib, self.cpu_cores, self.disk_gib, self.secondary_disk_gib
        )
    }

    /// Inverse of [`QuotaSpec::to_label`].
    #[must_use]
    pub fn from_label(label: &str) -> Option<Self> {
        let mut parts = label.split(',').map(|p| p.trim().parse::<u32>().ok());
        let spec = Self::new(
            parts.next()??,
            parts.next()??,
            parts.next()??,
            parts.next()??,
        );
        if parts.next().is_some() || spec.validate().is_err() {
            return None;
        }
        Some(spec)
    }
}

impl std::fmt::Display for QuotaSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} GiB RAM, {} CPU, {} GiB disk, {} GiB disk2",
            self.ram_gib, self.cpu_cores, self.disk_gib, self.secondary_disk_gib
        )
    }
}

impl From<&deskfarm_config::QuotaConfig> for QuotaSpec {
    fn from(cfg: &deskfarm_config::QuotaConfig) -> Self {
        Self::new(
            cfg.ram_gib,
            cfg.cpu_cores,
            cfg.disk_gib,
            cfg.secondary_disk_gib,
        )
    }
}

/// Whether a promo code survives being redeemed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RedemptionPolicy {
    #[default]
    Reusable,
    SingleUse,
}

impl std::str::FromStr for RedemptionPolicy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "reusable" => Ok(Self::Reusable),
            "single-use" | "single_use" | "once" => Ok(Self::SingleUse),
            other => Err(Error::InvalidCommand(format!(
                "unknown redemption policy '{other}' (expected reusable or single-use)"
            ))),
        }
    }
}

/// A redeemable code bound to a quota grant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PromoCode {
    pub code: String,
    pub grant: QuotaSpec,
}

#[derive(Debug, Clone)]
struct PromoEntry {
    grant: QuotaSpec,
    redeemed: bool,
}

/// Default preset plus the process-wide promo code table.
pub struct QuotaCatalog {
    defaults: RwLock<QuotaSpec>,
    codes: Mutex<HashMap<String, PromoEntry>>,
    policy: RedemptionPolicy,
    max_attempts: u32,
}

impl QuotaCatalog {
    /// Create a catalog. The default preset is validated up front.
    pub fn new(defaults: QuotaSpec, policy: RedemptionPolicy, max_attempts: u32) -> Result<Self> {
        defaults.validate()?;
        Ok(Self {
            defaults: RwLock::new(defaults),
            codes: Mutex::new(HashMap::new()),
            policy,
            max_attempts: max_attempts.max(1),
        })
    }

    /// Build from the `[defaults]` and `[promo]` config sections.
    pub fn from_config(config: &deskfarm_config::DeskfarmConfig) -> Result<Self> {
        let policy = config.promo.redemption.parse()?;
        Self::new(
            QuotaSpec::from(&config.defaults),
            policy,
            config.promo.max_attempts,
        )
    }

    #[must_use]
    pub fn policy(&self) -> RedemptionPolicy {
        self.policy
    }

    /// Current default preset.
    #[must_use]
    pub fn defaults(&self) -> QuotaSpec {
        *self
            .defaults
            .read()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Replace the default preset.
    pub fn set_defaults(&self, spec: QuotaSpec) -> Result<()> {
        spec.validate()?;
        *self
            .defaults
            .write()
            .unwrap_or_else(PoisonError::into_inner) = spec;
        info!(quota = %spec, "default quota updated");
        Ok(())
    }

    /// Default preset without a code, the code's grant with one.
    pub fn resolve_quota(&self, code: Option<&str>) -> Result<QuotaSpec> {
        match code {
            None => Ok(self.defaults()),
            Some(code) => self.redeem(code),
        }
    }

    /// Look up a code and apply the redemption policy.
    ///
    /// This is the only place the policy is enforced; under
    /// [`RedemptionPolicy::SingleUse`] the code is claimed atomically.
    pub fn redeem(&self, code: &str) -> Result<QuotaSpec> {
        let code = normalize_code(code);
        let mut codes = self.codes();
        let entry = codes
            .get_mut(&code)
            .ok_or_else(|| Error::UnknownPromoCode(code.clone()))?;
        match self.policy {
            RedemptionPolicy::Reusable => {},
            RedemptionPolicy::SingleUse if entry.redeemed => {
                return Err(Error::UnknownPromoCode(format!("{code} (already redeemed)")));
            },
            RedemptionPolicy::SingleUse => entry.redeemed = true,
        }
        debug!(code = %code, "promo code redeemed");
        Ok(entry.grant)
    }

    /// Undo a single-use claim after the deploy that claimed it failed.
    pub fn restore(&self, code: &str) {
        if self.policy == RedemptionPolicy::Reusable {
            return;
        }
        if let Some(entry) = self.codes().get_mut(&normalize_code(code)) {
            entry.redeemed = false;
            debug!(code, "promo code restored");
        }
    }

    /// Issue a fresh random code for `grant`.
    pub fn issue_promo_code(&self, grant: QuotaSpec) -> Result<PromoCode> {
        let mut rng = rand::rng();
        self.issue_with(grant, || random_code(&mut rng))
    }

    /// Issue a code drawn from `generate`, retrying on collision.
    ///
    /// An existing grant is never overwritten.
    pub fn issue_with(
        &self,
        grant: QuotaSpec,
        mut generate: impl FnMut() -> String,
    ) -> Result<PromoCode> {
        grant.validate()?;
        let mut codes = self.codes();
        for attempt in 1..=self.max_attempts {
            let code = generate();
            if codes.contains_key(&code) {
                debug!(attempt, "promo code collision, retrying");
                continue;
            }
            codes.insert(code.clone(), PromoEntry {
                grant,
                redeemed: false,
            });
            info!(code = %code, quota = %grant, "promo code issued");
            return Ok(PromoCode { code, grant });
        }
        Err(Error::CodeSpaceExhausted {
            attempts: self.max_attempts,
        })
    }

    /// Snapshot of all codes, sorted by code.
    #[must_use]
    pub fn promo_codes(&self) -> Vec<PromoCode> {
        let mut out: Vec<PromoCode> = self
            .codes()
            .iter()
            .map(|(code, entry)| PromoCode {
                code: code.clone(),
                grant: entry.grant,
            })
            .collect();
        out.sort_by(|a, b| a.code.cmp(&b.code));
        out
    }

    fn codes(&self) -> MutexGuard<'_, HashMap<String, PromoEntry>> {
        self.codes.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn normalize_code(code: &str) -> String {
    code.trim().to_ascii_uppercase()
}

/// Draw a random [`CODE_LEN`]-character code over `A-Z0-9`.
fn random_code(rng: &mut impl Rng) -> String {
    (0..CODE_LEN)
        .map(|_| char::from(CODE_ALPHABET[rng.random_range(0..CODE_ALPHABET.len())]))
        .collect()
}
