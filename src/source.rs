//! Programmable power source negotiation.

use embedded_hal_async::delay::DelayNs;

const DISCOVERY_ATTEMPTS: u8 = 3;
const DISCOVERY_RETRY_MS: u32 = 100;
const BUSY_RETRY_MS: u32 = 100;

/// Errors reported by the power source.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-03", derive(defmt::Format))]
pub enum PdError {
    /// The source is busy with another message; retrying shortly may succeed.
    Busy,
    /// The source rejected the request.
    Rejected,
    /// No programmable supply entry is available.
    Unsupported,
    /// Transport failure.
    Comm,
}

/// A programmable capability entry advertised by the source.
#[derive(Default, Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-03", derive(defmt::Format))]
pub struct PpsCapability {
    /// Index of the entry in the source's capability list.
    pub position: u8,
    /// mV
    pub max_voltage: u16,
    /// mA
    pub max_current: u16,
    /// mW
    pub max_power: u32,
}

/// Access to a USB PD source offering programmable (PPS) supply entries.
#[allow(async_fn_in_trait)]
pub trait PowerSource {
    /// Find the highest-power programmable entry that reaches at least `hint_mv`.
    async fn max_capability(&mut self, hint_mv: u16) -> Result<PpsCapability, PdError>;

    /// Request `millivolts` and `milliamps` from the entry at `position`.
    async fn select_pps(&mut self, position: u8, millivolts: u16, milliamps: u16) -> Result<(), PdError>;
}

/// The live contract of a charging session.
#[derive(Default, Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-03", derive(defmt::Format))]
pub struct SourceContract {
    /// Selected entry.
    pub position: u8,
    /// Entry voltage ceiling, mV.
    pub max_voltage: u16,
    /// Entry current ceiling, mA.
    pub max_current: u16,
    /// Entry power ceiling, mW.
    pub max_power: u32,
    /// Last granted voltage, mV. Zero before the first request.
    pub requested_voltage: u16,
    /// Last granted current, mA. Zero before the first request.
    pub requested_current: u16,
}

impl SourceContract {
    fn from_capability(cap: PpsCapability) -> Self {
        SourceContract {
            position: cap.position,
            max_voltage: cap.max_voltage,
            max_current: cap.max_current,
            max_power: cap.max_power,
            requested_voltage: 0,
            requested_current: 0,
        }
    }

    /// Whether `millivolts` at `milliamps` fits the entry's ceilings.
    pub fn allows(&self, millivolts: u16, milliamps: u16) -> bool {
        millivolts <= self.max_voltage
            && milliamps <= self.max_current
            && millivolts as u32 * milliamps as u32 / 1000 <= self.max_power
    }

    /// The largest current the entry can deliver at `millivolts`, rounded down to `step`.
    pub fn current_ceiling(&self, millivolts: u16, step: u16) -> u16 {
        if millivolts == 0 {
            return self.max_current;
        }
        let by_power = (self.max_power * 1000 / millivolts as u32).min(u16::MAX as u32) as u16;
        let ceiling = self.max_current.min(by_power);
        ceiling - ceiling % step
    }
}

/// Serializes discovery and contract requests towards a [`PowerSource`] and remembers the
/// session contract.
pub struct Negotiator<P> {
    source: P,
    contract: Option<SourceContract>,
}

impl<P: PowerSource> Negotiator<P> {
    /// Create a new `Negotiator`
    pub fn new(source: P) -> Self {
        Negotiator {
            source,
            contract: None,
        }
    }

    /// The session contract, if the source has been discovered.
    pub fn contract(&self) -> Option<SourceContract> {
        self.contract
    }

    /// Forget the session contract.
    pub fn reset(&mut self) {
        self.contract = None;
    }

    /// Discover the source's highest-power programmable entry and start a new contract on it.
    ///
    /// Transient failures are retried, up to three attempts in total.
    pub async fn discover_max_power<D: DelayNs>(
        &mut self,
        hint_mv: u16,
        delay: &mut D,
    ) -> Result<SourceContract, PdError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.source.max_capability(hint_mv).await {
                Ok(cap) => {
                    debug!(
                        "pps: pos={} max {}mV {}mA {}mW",
                        cap.position,
                        cap.max_voltage,
                        cap.max_current,
                        cap.max_power
                    );
                    let contract = SourceContract::from_capability(cap);
                    self.contract = Some(contract);
                    return Ok(contract);
                }
                Err(PdError::Unsupported) => return Err(PdError::Unsupported),
                Err(e) if attempt >= DISCOVERY_ATTEMPTS => {
                    error!("pps: discovery failed: {:?}", e);
                    return Err(e);
                }
                Err(e) => {
                    warn!("pps: discovery attempt {} failed: {:?}", attempt, e);
                    delay.delay_ms(DISCOVERY_RETRY_MS).await;
                }
            }
        }
    }

    /// Request a new operating point on the session contract.
    ///
    /// A busy source gets exactly one more try after a short wait. On success the contract's
    /// requested voltage and current are updated.
    pub async fn request_contract<D: DelayNs>(
        &mut self,
        millivolts: u16,
        milliamps: u16,
        delay: &mut D,
    ) -> Result<SourceContract, PdError> {
        let Some(mut contract) = self.contract else {
            return Err(PdError::Unsupported);
        };
        trace!("pps: request {}mV {}mA", millivolts, milliamps);
        let res = match self.source.select_pps(contract.position, millivolts, milliamps).await {
            Err(PdError::Busy) => {
                warn!("pps: source busy, retrying");
                delay.delay_ms(BUSY_RETRY_MS).await;
                self.source.select_pps(contract.position, millivolts, milliamps).await
            }
            res => res,
        };
        if let Err(e) = res {
            error!("pps: request {}mV {}mA failed: {:?}", millivolts, milliamps, e);
            return Err(e);
        }
        contract.requested_voltage = millivolts;
        contract.requested_current = milliamps;
        self.contract = Some(contract);
        Ok(contract)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::vec::Vec;

    use super::*;
    use crate::testing::TestDelay;

    #[derive(Default)]
    struct ScriptedSource {
        caps: VecDeque<Result<PpsCapability, PdError>>,
        replies: VecDeque<Result<(), PdError>>,
        requests: Vec<(u8, u16, u16)>,
    }

    impl PowerSource for ScriptedSource {
        async fn max_capability(&mut self, _hint_mv: u16) -> Result<PpsCapability, PdError> {
            self.caps.pop_front().unwrap_or(Err(PdError::Comm))
        }

        async fn select_pps(&mut self, position: u8, millivolts: u16, milliamps: u16) -> Result<(), PdError> {
            self.requests.push((position, millivolts, milliamps));
            self.replies.pop_front().unwrap_or(Ok(()))
        }
    }

    const CAP: PpsCapability = PpsCapability {
        position: 4,
        max_voltage: 11000,
        max_current: 3000,
        max_power: 30000,
    };

    fn discovered(replies: &[Result<(), PdError>]) -> Negotiator<ScriptedSource> {
        let source = ScriptedSource {
            caps: [Ok(CAP)].into(),
            replies: replies.iter().copied().collect(),
            ..Default::default()
        };
        let mut neg = Negotiator::new(source);
        neg.contract = Some(SourceContract::from_capability(CAP));
        neg
    }

    #[tokio::test]
    async fn discovery_retries_transient_failures() {
        let source = ScriptedSource {
            caps: [Err(PdError::Comm), Err(PdError::Busy), Ok(CAP)].into(),
            ..Default::default()
        };
        let mut neg = Negotiator::new(source);
        let mut delay = TestDelay::default();

        let contract = neg.discover_max_power(8000, &mut delay).await.unwrap();
        assert_eq!(contract.position, 4);
        assert_eq!(contract.max_power, 30000);
        assert_eq!(delay.total_ms(), 2 * DISCOVERY_RETRY_MS as u64);
    }

    #[tokio::test]
    async fn discovery_gives_up_after_three_attempts() {
        let source = ScriptedSource {
            caps: [Err(PdError::Comm), Err(PdError::Comm), Err(PdError::Comm), Ok(CAP)].into(),
            ..Default::default()
        };
        let mut neg = Negotiator::new(source);
        let mut delay = TestDelay::default();

        assert_eq!(neg.discover_max_power(8000, &mut delay).await, Err(PdError::Comm));
        assert!(neg.contract().is_none());
    }

    #[tokio::test]
    async fn busy_is_retried_exactly_once() {
        let mut neg = discovered(&[Err(PdError::Busy), Ok(())]);
        let mut delay = TestDelay::default();

        let contract = neg.request_contract(7800, 2000, &mut delay).await.unwrap();
        assert_eq!(contract.requested_voltage, 7800);
        assert_eq!(neg.source.requests, [(4, 7800, 2000), (4, 7800, 2000)]);

        let mut neg = discovered(&[Err(PdError::Busy), Err(PdError::Busy), Ok(())]);
        assert_eq!(neg.request_contract(7800, 2000, &mut delay).await, Err(PdError::Busy));
        assert_eq!(neg.source.requests.len(), 2);
        assert_eq!(neg.contract().unwrap().requested_voltage, 0);
    }

    #[tokio::test]
    async fn rejection_is_not_retried() {
        let mut neg = discovered(&[Err(PdError::Rejected)]);
        let mut delay = TestDelay::default();

        assert_eq!(neg.request_contract(7800, 2000, &mut delay).await, Err(PdError::Rejected));
        assert_eq!(neg.source.requests.len(), 1);
        assert_eq!(delay.total_ms(), 0);
    }

    #[test]
    fn ceilings() {
        let contract = SourceContract::from_capability(CAP);
        assert!(contract.allows(9000, 3000));
        assert!(!contract.allows(11000, 3000));
        assert!(!contract.allows(11020, 100));
        assert_eq!(contract.current_ceiling(11000, 50), 2700);
        assert_eq!(contract.current_ceiling(8000, 50), 3000);
    }
}
