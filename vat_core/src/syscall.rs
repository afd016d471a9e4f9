//! Vat core - Syscall Gateway
//!
//! The narrow, ordered channel from a vat to the kernel, plus the shapes
//! the kernel uses to deliver work back in.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::capdata::CapData;
use crate::effects::{Effect, EffectLog};
use crate::error::{Result, VatError};
use crate::vref::VatRef;

/// One entry of a `resolve` syscall or a notify delivery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VatResolution {
    pub vpid: VatRef,
    pub rejected: bool,
    pub data: CapData,
}

/// A kernel delivery: exactly one per crank.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Delivery {
    Message {
        target: VatRef,
        method: String,
        args: CapData,
        result: Option<VatRef>,
    },
    Notify {
        resolutions: Vec<VatResolution>,
    },
}

pub trait Syscall {
    /// `result` names the vpid the vat allocated for the answer, if any.
    fn send(
        &mut self,
        target: &VatRef,
        method: &str,
        args: &CapData,
        result: Option<&VatRef>,
    ) -> Result<()>;
    fn subscribe(&mut self, target: &VatRef) -> Result<()>;
    fn resolve(&mut self, resolutions: &[VatResolution]) -> Result<()>;
    fn call_now(&mut self, target: &VatRef, method: &str, args: &CapData) -> Result<CapData>;
}

/// Synchronous device handler behind `call_now`.
pub type DeviceHandler = Box<dyn FnMut(&VatRef, &str, &CapData) -> Result<CapData>>;

/// Gateway that records every syscall into an effect log. Device calls are
/// answered by an optional handler.
pub struct RecordingSyscall {
    log: EffectLog,
    device: Option<DeviceHandler>,
}

impl RecordingSyscall {
    pub fn new(log: EffectLog) -> Self {
        Self { log, device: None }
    }

    pub fn with_device(log: EffectLog, device: DeviceHandler) -> Self {
        Self { log, device: Some(device) }
    }

    pub fn log(&self) -> &EffectLog {
        &self.log
    }
}

impl Syscall for RecordingSyscall {
    fn send(
        &mut self,
        target: &VatRef,
        method: &str,
        args: &CapData,
        result: Option<&VatRef>,
    ) -> Result<()> {
        debug!(target = %target, method, result = ?result.map(ToString::to_string), "syscall.send");
        self.log.push(Effect::Send {
            target: target.clone(),
            method: method.to_string(),
            args: args.clone(),
            result: result.cloned(),
        });
        Ok(())
    }

    fn subscribe(&mut self, target: &VatRef) -> Result<()> {
        debug!(target = %target, "syscall.subscribe");
        self.log.push(Effect::Subscribe { target: target.clone() });
        Ok(())
    }

    fn resolve(&mut self, resolutions: &[VatResolution]) -> Result<()> {
        for r in resolutions {
            debug!(vpid = %r.vpid, rejected = r.rejected, "syscall.resolve");
        }
        self.log.push(Effect::Resolve { resolutions: resolutions.to_vec() });
        Ok(())
    }

    fn call_now(&mut self, target: &VatRef, method: &str, args: &CapData) -> Result<CapData> {
        debug!(target = %target, method, "syscall.call_now");
        self.log.push(Effect::CallNow {
            target: target.clone(),
            method: method.to_string(),
            args: args.clone(),
        });
        match self.device.as_mut() {
            Some(device) => device(target, method, args),
            None => Err(VatError::Device(format!("no device answers {target}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vref::Direction;

    #[test]
    fn recording_preserves_call_order() {
        let log = EffectLog::new();
        let mut sys = RecordingSyscall::new(log.clone());
        let p5 = VatRef::promise(Direction::Exported, 5);
        sys.send(&VatRef::import_object(1), "one", &CapData::new("[]", vec![]), Some(&p5))
            .unwrap();
        sys.subscribe(&p5).unwrap();
        let kinds: Vec<_> = log.snapshot().iter().map(Effect::kind).collect();
        assert_eq!(kinds, vec!["send", "subscribe"]);
    }

    #[test]
    fn device_errors_propagate() {
        let log = EffectLog::new();
        let mut sys = RecordingSyscall::with_device(
            log.clone(),
            Box::new(|_, method, _| Err(VatError::Device(format!("{method} failed")))),
        );
        let err = sys
            .call_now(&VatRef::import_device(1), "poke", &CapData::new("[]", vec![]))
            .unwrap_err();
        assert_eq!(err, VatError::Device("poke failed".to_string()));
        assert_eq!(log.len(), 1);
    }

    #[test]
    fn deliveries_serialize_with_type_tag() {
        let delivery = Delivery::Notify {
            resolutions: vec![VatResolution {
                vpid: VatRef::promise(Direction::Exported, 5),
                rejected: false,
                data: CapData::new("4", vec![]),
            }],
        };
        let json = serde_json::to_string(&delivery).unwrap();
        assert!(json.starts_with(r#"{"type":"notify""#));
        let back: Delivery = serde_json::from_str(&json).unwrap();
        assert_eq!(back, delivery);
    }
}
