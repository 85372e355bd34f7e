//! Wire messages exchanged between the relay and its participants.
//!
//! Every message is a `u16` type tag followed by its fields, laid out with
//! the framing codec. Decoding is an exhaustive match on the tag; unknown
//! tags and trailing bytes are malformed frames.

use bytes::Bytes;
use curve25519_dalek::ristretto::RistrettoPoint;

use super::framing::{FramingError, WireReader, WireWriter};
use crate::config::DcNetType;
use crate::crypto::{
    DleqProof, KnownShuffleProof, PermutationArgument, PublicKey, ShuffleProof, Signature,
    ELEMENT_SIZE, SIGNATURE_SIZE,
};
use crate::error::ProtocolError;
use crate::schedule::ShuffleTranscript;

pub const ALL_ALL_PARAMETERS: u16 = 1;
pub const ALL_ALL_SHUTDOWN: u16 = 2;
pub const CLI_REL_TELL_PK_AND_EPH_PK: u16 = 3;
pub const REL_CLI_TELL_TRUSTEES_PK: u16 = 4;
pub const REL_TRU_TELL_CLIENTS_PKS_AND_EPH_PKS_AND_BASE: u16 = 5;
pub const TRU_REL_TELL_NEW_BASE_AND_EPH_PKS: u16 = 6;
pub const REL_TRU_TELL_TRANSCRIPT: u16 = 7;
pub const TRU_REL_SHUFFLE_SIG: u16 = 8;
pub const REL_CLI_TELL_EPH_PKS_AND_TRUSTEES_SIG: u16 = 9;
pub const CLI_REL_UPSTREAM_DATA: u16 = 10;
pub const TRU_REL_DC_CIPHER: u16 = 11;
pub const REL_CLI_DOWNSTREAM_DATA: u16 = 12;
pub const REL_TRU_TELL_RATE_CHANGE: u16 = 13;
pub const TRU_REL_SHUFFLE_REJECT: u16 = 14;
pub const CLI_REL_DOWNSTREAM_NACK: u16 = 15;
pub const REL_TRU_TELL_DOWNSTREAM_DIGEST: u16 = 16;

const VALUE_INT: u8 = 0;
const VALUE_BOOL: u8 = 1;
const VALUE_STR: u8 = 2;

const ARGUMENT_KNOWN: u8 = 0;
const ARGUMENT_OPENING: u8 = 1;

#[derive(Debug, thiserror::Error)]
pub enum MessageError {
    #[error(transparent)]
    Framing(#[from] FramingError),
    #[error("unknown message type {0}")]
    UnknownType(u16),
    #[error("bad value for {key}: {reason}")]
    BadValue { key: String, reason: String },
    #[error("missing parameter {0}")]
    MissingParameter(&'static str),
}

impl From<MessageError> for ProtocolError {
    fn from(e: MessageError) -> Self {
        match e {
            MessageError::Framing(f) => f.into(),
            other => ProtocolError::MalformedFrame(other.to_string()),
        }
    }
}

/// Run parameters the relay hands every participant before setup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Parameters {
    pub n_clients: u32,
    pub n_trustees: u32,
    pub up_cell_size: u32,
    pub down_cell_size: u32,
    pub window_size: u32,
    pub use_udp: bool,
    pub use_dummy_data_down: bool,
    pub reporting_limit: u32,
    pub start_now: bool,
    pub dcnet_type: DcNetType,
    /// Dense id of the recipient within its role for this run
    pub participant_id: u32,
    pub udp_port: u32,
    pub do_latency_tests: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum ParamValue {
    Int(u32),
    Bool(bool),
    Str(String),
}

impl Parameters {
    fn pairs(&self) -> Vec<(&'static str, ParamValue)> {
        vec![
            ("NClients", ParamValue::Int(self.n_clients)),
            ("NTrustees", ParamValue::Int(self.n_trustees)),
            ("UpCellSize", ParamValue::Int(self.up_cell_size)),
            ("DownCellSize", ParamValue::Int(self.down_cell_size)),
            ("WindowSize", ParamValue::Int(self.window_size)),
            ("UseUDP", ParamValue::Bool(self.use_udp)),
            ("UseDummyDataDown", ParamValue::Bool(self.use_dummy_data_down)),
            ("ReportingLimit", ParamValue::Int(self.reporting_limit)),
            ("StartNow", ParamValue::Bool(self.start_now)),
            ("DCNetType", ParamValue::Str(self.dcnet_type.to_string())),
            ("ParticipantId", ParamValue::Int(self.participant_id)),
            ("UdpPort", ParamValue::Int(self.udp_port)),
            ("DoLatencyTests", ParamValue::Bool(self.do_latency_tests)),
        ]
    }

    fn encode(&self, w: &mut WireWriter) {
        let pairs = self.pairs();
        w.put_u32(pairs.len() as u32);
        for (key, value) in pairs {
            w.put_bytes(key.as_bytes());
            match value {
                ParamValue::Int(v) => w.put_u8(VALUE_INT).put_u32(v),
                ParamValue::Bool(v) => w.put_u8(VALUE_BOOL).put_u8(v as u8),
                ParamValue::Str(v) => w.put_u8(VALUE_STR).put_bytes(v.as_bytes()),
            };
        }
    }

    fn decode(r: &mut WireReader) -> Result<Self, MessageError> {
        let count = r.get_count(6)?;
        let mut values = std::collections::HashMap::with_capacity(count);
        for _ in 0..count {
            let key = String::from_utf8_lossy(r.get_bytes()?).into_owned();
            let value = match r.get_u8()? {
                VALUE_INT => ParamValue::Int(r.get_u32()?),
                VALUE_BOOL => ParamValue::Bool(r.get_u8()? != 0),
                VALUE_STR => ParamValue::Str(String::from_utf8_lossy(r.get_bytes()?).into_owned()),
                other => {
                    return Err(MessageError::BadValue {
                        key,
                        reason: format!("unknown value tag {}", other),
                    })
                }
            };
            values.insert(key, value);
        }

        let int = |key: &'static str| match values.get(key) {
            Some(ParamValue::Int(v)) => Ok(*v),
            Some(_) => Err(MessageError::BadValue {
                key: key.to_string(),
                reason: "expected an integer".to_string(),
            }),
            None => Err(MessageError::MissingParameter(key)),
        };
        let flag = |key: &'static str| match values.get(key) {
            Some(ParamValue::Bool(v)) => Ok(*v),
            Some(_) => Err(MessageError::BadValue {
                key: key.to_string(),
                reason: "expected a boolean".to_string(),
            }),
            None => Err(MessageError::MissingParameter(key)),
        };
        let dcnet_type = match values.get("DCNetType") {
            Some(ParamValue::Str(s)) => s.parse().map_err(|_| MessageError::BadValue {
                key: "DCNetType".to_string(),
                reason: format!("unknown codec {:?}", s),
            })?,
            Some(_) => {
                return Err(MessageError::BadValue {
                    key: "DCNetType".to_string(),
                    reason: "expected a string".to_string(),
                })
            }
            None => return Err(MessageError::MissingParameter("DCNetType")),
        };

        Ok(Self {
            n_clients: int("NClients")?,
            n_trustees: int("NTrustees")?,
            up_cell_size: int("UpCellSize")?,
            down_cell_size: int("DownCellSize")?,
            window_size: int("WindowSize")?,
            use_udp: flag("UseUDP")?,
            use_dummy_data_down: flag("UseDummyDataDown")?,
            reporting_limit: int("ReportingLimit")?,
            start_now: flag("StartNow")?,
            dcnet_type,
            participant_id: int("ParticipantId")?,
            udp_port: int("UdpPort")?,
            do_latency_tests: flag("DoLatencyTests")?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Parameters(Parameters),
    Shutdown,
    /// Client long-term key and fresh ephemeral key
    ClientKeys {
        public_key: PublicKey,
        ephemeral: RistrettoPoint,
    },
    TrusteeKeys {
        trustees: Vec<PublicKey>,
    },
    ShuffleRequest {
        clients: Vec<PublicKey>,
        ephemerals: Vec<RistrettoPoint>,
        base: RistrettoPoint,
    },
    ShuffleResponse {
        base: RistrettoPoint,
        ephemerals: Vec<RistrettoPoint>,
        proof: ShuffleProof,
    },
    Transcript(ShuffleTranscript),
    ShuffleSignature {
        trustee_id: u32,
        signature: Signature,
    },
    /// Final shuffled keys and every trustee's signature over them
    Schedule {
        base: RistrettoPoint,
        ephemerals: Vec<RistrettoPoint>,
        signatures: Vec<Signature>,
    },
    UpstreamCell {
        round: u32,
        client_id: u32,
        data: Bytes,
    },
    TrusteeCell {
        round: u32,
        trustee_id: u32,
        data: Bytes,
    },
    Downstream {
        round: u32,
        data: Bytes,
        flag_resync: bool,
    },
    /// Trustee window: 0 pauses, anything else resumes
    RateChange {
        window: u32,
    },
    ShuffleReject {
        trustee_id: u32,
        faulty_index: u32,
    },
    DownstreamNack {
        client_id: u32,
        round: u32,
    },
    DownstreamDigest {
        round: u32,
        digest: [u8; 32],
    },
}

impl Message {
    pub fn type_id(&self) -> u16 {
        match self {
            Message::Parameters(_) => ALL_ALL_PARAMETERS,
            Message::Shutdown => ALL_ALL_SHUTDOWN,
            Message::ClientKeys { .. } => CLI_REL_TELL_PK_AND_EPH_PK,
            Message::TrusteeKeys { .. } => REL_CLI_TELL_TRUSTEES_PK,
            Message::ShuffleRequest { .. } => REL_TRU_TELL_CLIENTS_PKS_AND_EPH_PKS_AND_BASE,
            Message::ShuffleResponse { .. } => TRU_REL_TELL_NEW_BASE_AND_EPH_PKS,
            Message::Transcript(_) => REL_TRU_TELL_TRANSCRIPT,
            Message::ShuffleSignature { .. } => TRU_REL_SHUFFLE_SIG,
            Message::Schedule { .. } => REL_CLI_TELL_EPH_PKS_AND_TRUSTEES_SIG,
            Message::UpstreamCell { .. } => CLI_REL_UPSTREAM_DATA,
            Message::TrusteeCell { .. } => TRU_REL_DC_CIPHER,
            Message::Downstream { .. } => REL_CLI_DOWNSTREAM_DATA,
            Message::RateChange { .. } => REL_TRU_TELL_RATE_CHANGE,
            Message::ShuffleReject { .. } => TRU_REL_SHUFFLE_REJECT,
            Message::DownstreamNack { .. } => CLI_REL_DOWNSTREAM_NACK,
            Message::DownstreamDigest { .. } => REL_TRU_TELL_DOWNSTREAM_DIGEST,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Message::Parameters(_) => "ALL_ALL_PARAMETERS",
            Message::Shutdown => "ALL_ALL_SHUTDOWN",
            Message::ClientKeys { .. } => "CLI_REL_TELL_PK_AND_EPH_PK",
            Message::TrusteeKeys { .. } => "REL_CLI_TELL_TRUSTEES_PK",
            Message::ShuffleRequest { .. } => "REL_TRU_TELL_CLIENTS_PKS_AND_EPH_PKS_AND_BASE",
            Message::ShuffleResponse { .. } => "TRU_REL_TELL_NEW_BASE_AND_EPH_PKS",
            Message::Transcript(_) => "REL_TRU_TELL_TRANSCRIPT",
            Message::ShuffleSignature { .. } => "TRU_REL_SHUFFLE_SIG",
            Message::Schedule { .. } => "REL_CLI_TELL_EPH_PKS_AND_TRUSTEES_SIG",
            Message::UpstreamCell { .. } => "CLI_REL_UPSTREAM_DATA",
            Message::TrusteeCell { .. } => "TRU_REL_DC_CIPHER",
            Message::Downstream { .. } => "REL_CLI_DOWNSTREAM_DATA",
            Message::RateChange { .. } => "REL_TRU_TELL_RATE_CHANGE",
            Message::ShuffleReject { .. } => "TRU_REL_SHUFFLE_REJECT",
            Message::DownstreamNack { .. } => "CLI_REL_DOWNSTREAM_NACK",
            Message::DownstreamDigest { .. } => "REL_TRU_TELL_DOWNSTREAM_DIGEST",
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut w = WireWriter::new();
        w.put_u16(self.type_id());
        match self {
            Message::Parameters(params) => params.encode(&mut w),
            Message::Shutdown => {}
            Message::ClientKeys {
                public_key,
                ephemeral,
            } => {
                w.put_point(public_key.point()).put_point(ephemeral);
            }
            Message::TrusteeKeys { trustees } => put_keys(&mut w, trustees),
            Message::ShuffleRequest {
                clients,
                ephemerals,
                base,
            } => {
                put_keys(&mut w, clients);
                w.put_points(ephemerals).put_point(base);
            }
            Message::ShuffleResponse {
                base,
                ephemerals,
                proof,
            } => {
                w.put_point(base).put_points(ephemerals);
                put_proof(&mut w, proof);
            }
            Message::Transcript(transcript) => {
                w.put_points(&transcript.bases);
                w.put_u32(transcript.keys.len() as u32);
                for keys in &transcript.keys {
                    w.put_points(keys);
                }
                w.put_u32(transcript.proofs.len() as u32);
                for proof in &transcript.proofs {
                    put_proof(&mut w, proof);
                }
            }
            Message::ShuffleSignature {
                trustee_id,
                signature,
            } => {
                w.put_u32(*trustee_id).put_bytes(&signature.to_bytes());
            }
            Message::Schedule {
                base,
                ephemerals,
                signatures,
            } => {
                w.put_point(base).put_points(ephemerals);
                w.put_u32(signatures.len() as u32);
                for sig in signatures {
                    w.put_bytes(&sig.to_bytes());
                }
            }
            Message::UpstreamCell {
                round,
                client_id,
                data,
            } => {
                w.put_u32(*round).put_u32(*client_id).put_bytes(data);
            }
            Message::TrusteeCell {
                round,
                trustee_id,
                data,
            } => {
                w.put_u32(*round).put_u32(*trustee_id).put_bytes(data);
            }
            Message::Downstream {
                round,
                data,
                flag_resync,
            } => {
                w.put_u32(*round)
                    .put_bytes(data)
                    .put_u32(*flag_resync as u32);
            }
            Message::RateChange { window } => {
                w.put_u32(*window);
            }
            Message::ShuffleReject {
                trustee_id,
                faulty_index,
            } => {
                w.put_u32(*trustee_id).put_u32(*faulty_index);
            }
            Message::DownstreamNack { client_id, round } => {
                w.put_u32(*client_id).put_u32(*round);
            }
            Message::DownstreamDigest { round, digest } => {
                w.put_u32(*round).put_bytes(digest);
            }
        }
        w.finish()
    }

    pub fn decode(buf: &[u8]) -> Result<Self, MessageError> {
        let mut r = WireReader::new(buf);
        let msg = match r.get_u16()? {
            ALL_ALL_PARAMETERS => Message::Parameters(Parameters::decode(&mut r)?),
            ALL_ALL_SHUTDOWN => Message::Shutdown,
            CLI_REL_TELL_PK_AND_EPH_PK => Message::ClientKeys {
                public_key: PublicKey::from_point(r.get_point()?),
                ephemeral: r.get_point()?,
            },
            REL_CLI_TELL_TRUSTEES_PK => Message::TrusteeKeys {
                trustees: get_keys(&mut r)?,
            },
            REL_TRU_TELL_CLIENTS_PKS_AND_EPH_PKS_AND_BASE => Message::ShuffleRequest {
                clients: get_keys(&mut r)?,
                ephemerals: r.get_points()?,
                base: r.get_point()?,
            },
            TRU_REL_TELL_NEW_BASE_AND_EPH_PKS => Message::ShuffleResponse {
                base: r.get_point()?,
                ephemerals: r.get_points()?,
                proof: get_proof(&mut r)?,
            },
            REL_TRU_TELL_TRANSCRIPT => {
                let bases = r.get_points()?;
                let n_lists = r.get_count(4)?;
                let keys = (0..n_lists)
                    .map(|_| r.get_points())
                    .collect::<Result<Vec<_>, _>>()?;
                let n_proofs = r.get_count(ELEMENT_SIZE)?;
                let proofs = (0..n_proofs)
                    .map(|_| get_proof(&mut r))
                    .collect::<Result<Vec<_>, _>>()?;
                Message::Transcript(ShuffleTranscript {
                    bases,
                    keys,
                    proofs,
                })
            }
            TRU_REL_SHUFFLE_SIG => Message::ShuffleSignature {
                trustee_id: r.get_u32()?,
                signature: get_signature(&mut r)?,
            },
            REL_CLI_TELL_EPH_PKS_AND_TRUSTEES_SIG => {
                let base = r.get_point()?;
                let ephemerals = r.get_points()?;
                let n = r.get_count(SIGNATURE_SIZE)?;
                let signatures = (0..n)
                    .map(|_| get_signature(&mut r))
                    .collect::<Result<Vec<_>, _>>()?;
                Message::Schedule {
                    base,
                    ephemerals,
                    signatures,
                }
            }
            CLI_REL_UPSTREAM_DATA => Message::UpstreamCell {
                round: r.get_u32()?,
                client_id: r.get_u32()?,
                data: Bytes::copy_from_slice(r.get_bytes()?),
            },
            TRU_REL_DC_CIPHER => Message::TrusteeCell {
                round: r.get_u32()?,
                trustee_id: r.get_u32()?,
                data: Bytes::copy_from_slice(r.get_bytes()?),
            },
            REL_CLI_DOWNSTREAM_DATA => Message::Downstream {
                round: r.get_u32()?,
                data: Bytes::copy_from_slice(r.get_bytes()?),
                flag_resync: r.get_u32()? != 0,
            },
            REL_TRU_TELL_RATE_CHANGE => Message::RateChange {
                window: r.get_u32()?,
            },
            TRU_REL_SHUFFLE_REJECT => Message::ShuffleReject {
                trustee_id: r.get_u32()?,
                faulty_index: r.get_u32()?,
            },
            CLI_REL_DOWNSTREAM_NACK => Message::DownstreamNack {
                client_id: r.get_u32()?,
                round: r.get_u32()?,
            },
            REL_TRU_TELL_DOWNSTREAM_DIGEST => {
                let round = r.get_u32()?;
                let digest: [u8; 32] =
                    r.get_bytes()?
                        .try_into()
                        .map_err(|_| MessageError::BadValue {
                            key: "digest".to_string(),
                            reason: "expected 32 bytes".to_string(),
                        })?;
                Message::DownstreamDigest { round, digest }
            }
            other => return Err(MessageError::UnknownType(other)),
        };
        r.finish()?;
        Ok(msg)
    }
}

fn put_keys(w: &mut WireWriter, keys: &[PublicKey]) {
    w.put_u32(keys.len() as u32);
    for k in keys {
        w.put_point(k.point());
    }
}

fn get_keys(r: &mut WireReader) -> Result<Vec<PublicKey>, FramingError> {
    Ok(r.get_points()?.into_iter().map(PublicKey::from_point).collect())
}

fn get_signature(r: &mut WireReader) -> Result<Signature, MessageError> {
    Signature::from_bytes(r.get_bytes()?).map_err(|e| MessageError::BadValue {
        key: "signature".to_string(),
        reason: e.to_string(),
    })
}

fn put_proof(w: &mut WireWriter, proof: &ShuffleProof) {
    w.put_point(&proof.c)
        .put_point(&proof.cd)
        .put_point(&proof.ed)
        .put_scalars(&proof.f);
    match &proof.argument {
        PermutationArgument::Known(k) => {
            w.put_u8(ARGUMENT_KNOWN)
                .put_point(&k.cd)
                .put_point(&k.cdd)
                .put_point(&k.cda)
                .put_scalars(&k.f)
                .put_scalar(&k.z)
                .put_scalars(&k.fd)
                .put_scalar(&k.zd);
        }
        PermutationArgument::Opening(rho) => {
            w.put_u8(ARGUMENT_OPENING).put_scalar(rho);
        }
    }
    w.put_scalar(&proof.dleq.c).put_scalar(&proof.dleq.r);
}

fn get_proof(r: &mut WireReader) -> Result<ShuffleProof, MessageError> {
    let c = r.get_point()?;
    let cd = r.get_point()?;
    let ed = r.get_point()?;
    let f = r.get_scalars()?;
    let argument = match r.get_u8()? {
        ARGUMENT_KNOWN => PermutationArgument::Known(KnownShuffleProof {
            cd: r.get_point()?,
            cdd: r.get_point()?,
            cda: r.get_point()?,
            f: r.get_scalars()?,
            z: r.get_scalar()?,
            fd: r.get_scalars()?,
            zd: r.get_scalar()?,
        }),
        ARGUMENT_OPENING => PermutationArgument::Opening(r.get_scalar()?),
        other => {
            return Err(MessageError::BadValue {
                key: "proof".to_string(),
                reason: format!("unknown permutation argument {}", other),
            })
        }
    };
    let dleq = DleqProof {
        c: r.get_scalar()?,
        r: r.get_scalar()?,
    };
    Ok(ShuffleProof {
        c,
        cd,
        ed,
        f,
        argument,
        dleq,
    })
}
