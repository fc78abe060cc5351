//! Binary attachment deconstruction and reconstruction
//!
//! Encoding replaces every raw binary leaf in a payload tree with an indexed
//! placeholder and collects the attachments in document order. Decoding runs
//! the inverse substitution once all attachment frames have arrived.

use crate::error::ParseError;
use crate::value::Data;
use bytes::Bytes;

/// Replace every binary leaf with a placeholder, returning the extracted
/// attachments in document order.
pub fn deconstruct(data: &mut Data) -> Vec<Bytes> {
    let mut attachments = Vec::new();
    replace_binary(data, &mut attachments);
    attachments
}

fn replace_binary(node: &mut Data, out: &mut Vec<Bytes>) {
    match node {
        Data::Binary(_) => {
            let index = out.len();
            if let Data::Binary(bytes) = std::mem::replace(node, Data::Placeholder(index)) {
                out.push(bytes);
            }
        }
        Data::Array(items) => {
            for item in items {
                replace_binary(item, out);
            }
        }
        Data::Object(entries) => {
            for (_, value) in entries {
                replace_binary(value, out);
            }
        }
        _ => {}
    }
}

/// Substitute placeholders with the received attachments.
///
/// A placeholder index outside the received range fails the whole packet
/// with `ParseError::IllegalAttachments`.
pub fn reconstruct(data: &mut Data, attachments: &[Bytes]) -> Result<(), ParseError> {
    match data {
        Data::Placeholder(num) => {
            let bytes = attachments
                .get(*num)
                .ok_or(ParseError::IllegalAttachments)?;
            *data = Data::Binary(bytes.clone());
            Ok(())
        }
        Data::Array(items) => {
            for item in items {
                reconstruct(item, attachments)?;
            }
            Ok(())
        }
        Data::Object(entries) => {
            for (_, value) in entries {
                reconstruct(value, attachments)?;
            }
            Ok(())
        }
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deconstruct_orders_attachments() {
        let mut data = Data::Array(vec![
            Data::Binary(Bytes::from_static(b"first")),
            Data::Object(vec![(
                "body".into(),
                Data::Binary(Bytes::from_static(b"second")),
            )]),
        ]);

        let attachments = deconstruct(&mut data);
        assert_eq!(attachments.len(), 2);
        assert_eq!(attachments[0], Bytes::from_static(b"first"));
        assert_eq!(attachments[1], Bytes::from_static(b"second"));
        assert_eq!(
            data,
            Data::Array(vec![
                Data::Placeholder(0),
                Data::Object(vec![("body".into(), Data::Placeholder(1))]),
            ])
        );
    }

    #[test]
    fn test_reconstruct_roundtrip() {
        let original = Data::Array(vec![
            Data::Text("upload".into()),
            Data::Binary(Bytes::from_static(b"\x00\x01\x02")),
        ]);

        let mut data = original.clone();
        let attachments = deconstruct(&mut data);
        reconstruct(&mut data, &attachments).unwrap();
        assert_eq!(data, original);
    }

    #[test]
    fn test_reconstruct_rejects_out_of_range() {
        let mut data = Data::Array(vec![Data::Placeholder(1)]);
        let attachments = vec![Bytes::from_static(b"only one")];

        let err = reconstruct(&mut data, &attachments).unwrap_err();
        assert!(matches!(err, ParseError::IllegalAttachments));
    }

    #[test]
    fn test_deconstruct_without_binary_is_noop() {
        let mut data = Data::Array(vec![Data::Text("plain".into())]);
        let attachments = deconstruct(&mut data);
        assert!(attachments.is_empty());
        assert_eq!(data, Data::Array(vec![Data::Text("plain".into())]));
    }
}
