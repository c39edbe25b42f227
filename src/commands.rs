//! Decoding of the plugin commands from OSC-typed argument lists.
//!
//! The host decodes the OSC wire format; what reaches this module is the
//! command name and its typed argument atoms. Decoding runs on the real-time
//! thread (stage 1): a malformed argument list drops the whole command —
//! whatever was copied so far goes away with the reader — and no pipeline is
//! submitted.

use std::path::PathBuf;
use std::slice;

use rosc::OscType;

use crate::error::CommandError;

/// A fully decoded plugin command.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// Publish the script stored in a file: `hash, path, numParams,
    /// paramName × numParams, [completion]`.
    AddFile {
        hash: i32,
        path: PathBuf,
        param_names: Vec<String>,
        completion: Option<Vec<u8>>,
    },
    /// Publish a script carried in the message itself: `hash, source,
    /// numParams, paramName × numParams, [completion]`.
    AddScript {
        hash: i32,
        source: String,
        param_names: Vec<String>,
        completion: Option<Vec<u8>>,
    },
    /// Free one script: `hash`.
    Free { hash: i32 },
    /// Free every registered script.
    FreeAll,
}

impl Command {
    pub fn parse(name: &str, args: &[OscType]) -> Result<Self, CommandError> {
        let mut reader = MsgReader::new(args);
        match name {
            "add-file" => {
                let (hash, path, param_names, completion) = script_args(&mut reader, "path")?;
                Ok(Command::AddFile {
                    hash,
                    path: PathBuf::from(path),
                    param_names,
                    completion,
                })
            }
            "add-script" => {
                let (hash, source, param_names, completion) = script_args(&mut reader, "source")?;
                Ok(Command::AddScript {
                    hash,
                    source,
                    param_names,
                    completion,
                })
            }
            "free" => Ok(Command::Free {
                hash: reader.int("hash")?,
            }),
            "free-all" => Ok(Command::FreeAll),
            other => Err(CommandError::UnknownCommand(other.to_owned())),
        }
    }
}

fn script_args(
    reader: &mut MsgReader<'_>,
    body_name: &'static str,
) -> Result<(i32, String, Vec<String>, Option<Vec<u8>>), CommandError> {
    let hash = reader.int("hash")?;
    let body = reader.string(body_name)?.to_owned();
    let num_params = reader.int("numParams")?;
    if num_params < 0 {
        return Err(CommandError::NegativeCount { what: "numParams" });
    }
    let mut param_names = Vec::with_capacity(num_params as usize);
    for _ in 0..num_params {
        param_names.push(reader.string("paramName")?.to_owned());
    }
    let completion = reader.blob_opt().map(<[u8]>::to_vec);
    Ok((hash, body, param_names, completion))
}

/// A typed cursor over an argument list, the crate's rendition of the host's
/// message iterator.
pub struct MsgReader<'a> {
    args: slice::Iter<'a, OscType>,
}

impl<'a> MsgReader<'a> {
    pub fn new(args: &'a [OscType]) -> Self {
        Self { args: args.iter() }
    }

    pub fn int(&mut self, what: &'static str) -> Result<i32, CommandError> {
        match self.args.next() {
            Some(OscType::Int(value)) => Ok(*value),
            Some(_) => Err(CommandError::WrongType {
                what,
                expected: "int32",
            }),
            None => Err(CommandError::MissingArg { what }),
        }
    }

    pub fn string(&mut self, what: &'static str) -> Result<&'a str, CommandError> {
        match self.args.next() {
            Some(OscType::String(value)) => Ok(value),
            Some(_) => Err(CommandError::WrongType {
                what,
                expected: "string",
            }),
            None => Err(CommandError::MissingArg { what }),
        }
    }

    /// A trailing optional blob; anything else leaves the cursor untouched.
    pub fn blob_opt(&mut self) -> Option<&'a [u8]> {
        match self.args.clone().next() {
            Some(OscType::Blob(value)) => {
                self.args.next();
                Some(value.as_slice())
            }
            _ => None,
        }
    }
}
