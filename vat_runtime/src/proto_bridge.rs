//! Proto ↔ core conversion bridge.
//!
//! Converts between the transcript wire types (proto_types.rs) and the
//! core's `Delivery`. Decoding is strict: a frame with a missing delivery,
//! missing payload or malformed ref is rejected rather than defaulted.

use vat_core::{CapData, Delivery, VatRef, VatResolution};

use crate::error::{Result, RuntimeError};
use crate::proto_types::*;

/// Wrap a delivery in a transcript frame.
pub fn delivery_to_proto(sequence: u64, delivery: &Delivery) -> ProtoDeliveryFrame {
    let kind = match delivery {
        Delivery::Message { target, method, args, result } => DeliveryKind::Message(ProtoMessage {
            target: target.to_string(),
            method: method.clone(),
            args: Some(capdata_to_proto(args)),
            result: result.as_ref().map(VatRef::to_string),
        }),
        Delivery::Notify { resolutions } => DeliveryKind::Notify(ProtoNotify {
            resolutions: resolutions
                .iter()
                .map(|r| ProtoResolution {
                    vpid: r.vpid.to_string(),
                    rejected: r.rejected,
                    data: Some(capdata_to_proto(&r.data)),
                })
                .collect(),
        }),
    };
    ProtoDeliveryFrame {
        sequence,
        delivery: Some(ProtoDelivery { kind: Some(kind) }),
    }
}

/// Recover the delivery carried by a transcript frame.
pub fn proto_to_delivery(frame: &ProtoDeliveryFrame) -> Result<Delivery> {
    let kind = frame
        .delivery
        .as_ref()
        .and_then(|d| d.kind.as_ref())
        .ok_or_else(|| missing(frame.sequence, "delivery"))?;

    match kind {
        DeliveryKind::Message(m) => Ok(Delivery::Message {
            target: parse_ref(&m.target)?,
            method: m.method.clone(),
            args: proto_to_capdata(m.args.as_ref().ok_or_else(|| missing(frame.sequence, "args"))?)?,
            result: m.result.as_deref().map(parse_ref).transpose()?,
        }),
        DeliveryKind::Notify(n) => {
            let resolutions = n
                .resolutions
                .iter()
                .map(|r| {
                    let data = r.data.as_ref().ok_or_else(|| missing(frame.sequence, "data"))?;
                    Ok(VatResolution {
                        vpid: parse_ref(&r.vpid)?,
                        rejected: r.rejected,
                        data: proto_to_capdata(data)?,
                    })
                })
                .collect::<Result<Vec<_>>>()?;
            Ok(Delivery::Notify { resolutions })
        }
    }
}

fn capdata_to_proto(data: &CapData) -> ProtoCapData {
    ProtoCapData {
        body: data.body.clone(),
        slots: data.slots.iter().map(VatRef::to_string).collect(),
    }
}

fn proto_to_capdata(proto: &ProtoCapData) -> Result<CapData> {
    let slots = proto.slots.iter().map(|s| parse_ref(s)).collect::<Result<Vec<_>>>()?;
    Ok(CapData::new(proto.body.clone(), slots))
}

fn parse_ref(s: &str) -> Result<VatRef> {
    Ok(VatRef::parse(s)?)
}

fn missing(sequence: u64, field: &str) -> RuntimeError {
    RuntimeError::Decode(format!("frame {sequence}: missing {field}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use prost::Message;

    fn r(s: &str) -> VatRef {
        s.parse().unwrap()
    }

    #[test]
    fn message_survives_the_wire() {
        let delivery = Delivery::Message {
            target: r("o+0"),
            method: "run".into(),
            args: CapData::new(r#"[{"@qclass":"slot","index":0}]"#, vec![r("o-1")]),
            result: Some(r("p-3")),
        };
        let bytes = delivery_to_proto(7, &delivery).encode_to_vec();
        let frame = ProtoDeliveryFrame::decode(bytes.as_slice()).unwrap();
        assert_eq!(frame.sequence, 7);
        assert_eq!(proto_to_delivery(&frame).unwrap(), delivery);
    }

    #[test]
    fn absent_result_stays_absent() {
        let delivery = Delivery::Notify {
            resolutions: vec![VatResolution { vpid: r("p+5"), rejected: true, data: CapData::new("1", vec![]) }],
        };
        let frame = delivery_to_proto(1, &delivery);
        assert_eq!(proto_to_delivery(&frame).unwrap(), delivery);

        let message = delivery_to_proto(
            2,
            &Delivery::Message { target: r("o+0"), method: "m".into(), args: CapData::new("[]", vec![]), result: None },
        );
        match message.delivery.and_then(|d| d.kind) {
            Some(DeliveryKind::Message(m)) => assert_eq!(m.result, None),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn incomplete_frames_are_rejected() {
        let empty = ProtoDeliveryFrame { sequence: 4, delivery: None };
        assert!(matches!(proto_to_delivery(&empty), Err(RuntimeError::Decode(_))));

        let bad_ref = ProtoDeliveryFrame {
            sequence: 5,
            delivery: Some(ProtoDelivery {
                kind: Some(DeliveryKind::Message(ProtoMessage {
                    target: "x+1".into(),
                    method: "m".into(),
                    args: Some(ProtoCapData { body: "[]".into(), slots: vec![] }),
                    result: None,
                })),
            }),
        };
        assert!(matches!(proto_to_delivery(&bad_ref), Err(RuntimeError::Vat(_))));
    }
}
