//! KMIP request/response exchange over any byte stream.

use std::io::{Read, Write};

use tracing::debug;
use zeroize::Zeroizing;

use crate::ttlv::{message_len, tag, Item};
use crate::KmipError;

/// Protocol version sent in every request header.
pub const PROTOCOL_VERSION: (i32, i32) = (1, 2);

/// `Operation` enumeration values.
pub mod operation {
    #![allow(missing_docs)]
    pub const REGISTER: u32 = 0x03;
    pub const LOCATE: u32 = 0x08;
    pub const GET: u32 = 0x0A;
}

const OBJECT_TYPE_SYMMETRIC_KEY: u32 = 0x02;
const ALGORITHM_AES: u32 = 0x03;
const KEY_FORMAT_RAW: u32 = 0x01;
const NAME_TYPE_TEXT: u32 = 0x01;
const RESULT_SUCCESS: u32 = 0x00;
const USAGE_ENCRYPT_DECRYPT: i32 = 0x04 | 0x08;

/// A KMIP client session.
///
/// Each call sends one request message with a single batch item and waits
/// for the matching response.
#[derive(Debug)]
pub struct KmipSession<S> {
    stream: S,
}

impl<S: Read + Write> KmipSession<S> {
    /// Wraps a connected stream.
    pub const fn new(stream: S) -> Self {
        Self { stream }
    }

    /// Returns the underlying stream.
    pub fn into_inner(self) -> S {
        self.stream
    }

    /// Registers `key` as an AES symmetric key named `name` and returns the
    /// server's unique identifier for it.
    ///
    /// # Errors
    ///
    /// Returns `KmipError::Operation` if the server refuses the request and
    /// transport or decoding errors otherwise.
    pub fn register(&mut self, name: &str, key: &[u8]) -> Result<String, KmipError> {
        let bits = i32::try_from(key.len() * 8).map_err(|_| KmipError::InvalidKeySize(key.len()))?;
        let payload = vec![
            Item::enumeration(tag::OBJECT_TYPE, OBJECT_TYPE_SYMMETRIC_KEY),
            Item::structure(
                tag::TEMPLATE_ATTRIBUTE,
                vec![
                    name_attribute(name),
                    attribute(
                        "Cryptographic Usage Mask",
                        Item::integer(tag::ATTRIBUTE_VALUE, USAGE_ENCRYPT_DECRYPT),
                    ),
                ],
            ),
            Item::structure(
                tag::SYMMETRIC_KEY,
                vec![Item::structure(
                    tag::KEY_BLOCK,
                    vec![
                        Item::enumeration(tag::KEY_FORMAT_TYPE, KEY_FORMAT_RAW),
                        Item::structure(tag::KEY_VALUE, vec![Item::bytes(tag::KEY_MATERIAL, key)]),
                        Item::enumeration(tag::CRYPTOGRAPHIC_ALGORITHM, ALGORITHM_AES),
                        Item::integer(tag::CRYPTOGRAPHIC_LENGTH, bits),
                    ],
                )],
            ),
        ];

        let response = self.call(operation::REGISTER, payload)?;
        unique_identifier(&response)
    }

    /// Returns the identifiers of all symmetric keys named `name`.
    ///
    /// # Errors
    ///
    /// Returns transport, decoding or operation errors.
    pub fn locate(&mut self, name: &str) -> Result<Vec<String>, KmipError> {
        let payload = vec![
            attribute("Object Type", Item::enumeration(tag::ATTRIBUTE_VALUE, OBJECT_TYPE_SYMMETRIC_KEY)),
            name_attribute(name),
        ];

        let response = self.call(operation::LOCATE, payload)?;
        response
            .children(tag::UNIQUE_IDENTIFIER)
            .map(|item| {
                item.as_text()
                    .map(str::to_string)
                    .ok_or_else(|| KmipError::Protocol("unique identifier is not text".to_string()))
            })
            .collect()
    }

    /// Fetches the raw key material of object `uid`.
    ///
    /// # Errors
    ///
    /// Returns `KmipError::Protocol` if the object is not a raw symmetric key.
    pub fn get(&mut self, uid: &str) -> Result<Zeroizing<Vec<u8>>, KmipError> {
        let response = self.call(operation::GET, vec![Item::text(tag::UNIQUE_IDENTIFIER, uid)])?;
        let material = response
            .child(tag::SYMMETRIC_KEY)
            .and_then(|key| key.child(tag::KEY_BLOCK))
            .and_then(|block| block.child(tag::KEY_VALUE))
            .and_then(|value| value.child(tag::KEY_MATERIAL))
            .and_then(Item::as_bytes)
            .ok_or_else(|| KmipError::Protocol(format!("object \"{uid}\" is not a raw symmetric key")))?;
        Ok(Zeroizing::new(material.to_vec()))
    }

    fn call(&mut self, op: u32, payload: Vec<Item>) -> Result<Item, KmipError> {
        let request = Item::structure(
            tag::REQUEST_MESSAGE,
            vec![
                Item::structure(
                    tag::REQUEST_HEADER,
                    vec![
                        Item::structure(
                            tag::PROTOCOL_VERSION,
                            vec![
                                Item::integer(tag::PROTOCOL_VERSION_MAJOR, PROTOCOL_VERSION.0),
                                Item::integer(tag::PROTOCOL_VERSION_MINOR, PROTOCOL_VERSION.1),
                            ],
                        ),
                        Item::integer(tag::BATCH_COUNT, 1),
                    ],
                ),
                Item::structure(
                    tag::BATCH_ITEM,
                    vec![
                        Item::enumeration(tag::OPERATION, op),
                        Item::structure(tag::REQUEST_PAYLOAD, payload),
                    ],
                ),
            ],
        );

        let bytes = Zeroizing::new(request.to_bytes());
        self.stream.write_all(&bytes)?;
        self.stream.flush()?;
        debug!(operation = op, len = bytes.len(), "sent KMIP request");

        let response = read_message(&mut self.stream)?;
        if response.tag != tag::RESPONSE_MESSAGE {
            return Err(KmipError::Protocol(format!("unexpected message tag {:#08X}", response.tag)));
        }
        let batch = response
            .child(tag::BATCH_ITEM)
            .ok_or_else(|| KmipError::Protocol("response has no batch item".to_string()))?;

        let status = batch
            .child(tag::RESULT_STATUS)
            .and_then(Item::as_enum)
            .ok_or_else(|| KmipError::Protocol("response has no result status".to_string()))?;
        if status != RESULT_SUCCESS {
            return Err(KmipError::Operation {
                status,
                reason: batch.child(tag::RESULT_REASON).and_then(Item::as_enum),
                message: batch
                    .child(tag::RESULT_MESSAGE)
                    .and_then(Item::as_text)
                    .unwrap_or_default()
                    .to_string(),
            });
        }

        Ok(batch
            .child(tag::RESPONSE_PAYLOAD)
            .cloned()
            .unwrap_or_else(|| Item::structure(tag::RESPONSE_PAYLOAD, Vec::new())))
    }
}

/// Reads one complete TTLV message from `stream`.
///
/// # Errors
///
/// Returns I/O errors and decoding errors, including oversized messages.
pub fn read_message(stream: &mut impl Read) -> Result<Item, KmipError> {
    let mut header = [0u8; 8];
    stream.read_exact(&mut header)?;
    let total = message_len(&header)?;

    let mut buf = Zeroizing::new(vec![0u8; total]);
    buf[..8].copy_from_slice(&header);
    stream.read_exact(&mut buf[8..])?;
    let (item, _) = Item::decode(&buf)?;
    Ok(item)
}

fn attribute(name: &str, mut value: Item) -> Item {
    value.tag = tag::ATTRIBUTE_VALUE;
    Item::structure(tag::ATTRIBUTE, vec![Item::text(tag::ATTRIBUTE_NAME, name), value])
}

fn name_attribute(name: &str) -> Item {
    attribute(
        "Name",
        Item::structure(
            tag::ATTRIBUTE_VALUE,
            vec![Item::text(tag::NAME_VALUE, name), Item::enumeration(tag::NAME_TYPE, NAME_TYPE_TEXT)],
        ),
    )
}

fn unique_identifier(payload: &Item) -> Result<String, KmipError> {
    payload
        .child(tag::UNIQUE_IDENTIFIER)
        .and_then(Item::as_text)
        .map(str::to_string)
        .ok_or_else(|| KmipError::Protocol("response has no unique identifier".to_string()))
}

/// Returns the `Name` attribute value of a request payload, if any.
#[must_use]
pub fn requested_name(payload: &Item) -> Option<&str> {
    payload
        .children(tag::ATTRIBUTE)
        .chain(payload.child(tag::TEMPLATE_ATTRIBUTE).into_iter().flat_map(|t| t.children(tag::ATTRIBUTE)))
        .find(|attr| attr.child(tag::ATTRIBUTE_NAME).and_then(Item::as_text) == Some("Name"))
        .and_then(|attr| attr.child(tag::ATTRIBUTE_VALUE))
        .and_then(|value| value.child(tag::NAME_VALUE))
        .and_then(Item::as_text)
}
