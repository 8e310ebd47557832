use std::sync::{Arc, Mutex, MutexGuard};

use bytes::Bytes;
use instrlink_schema::{CommandSet, FieldValue, RegisterDef, RegisterSchema};
use tracing::debug;

use super::{Middleware, RegisterAddr, RegisterNext, RegisterValue, WriteAck};
use crate::error::Result;

/// Parameter table shared between the kit and the schema stage.
pub type SharedCommandSet = Arc<Mutex<CommandSet>>;

/// Resolves symbolic register names through a [`RegisterSchema`] and runs
/// named commands from a [`CommandSet`].
///
/// Writes to a field narrower than its register read the word first and
/// change only the field's bits; the read and the write happen under one
/// lock, so concurrent writes to sibling fields of a word both land.
/// Numeric addresses pass through untouched.
pub struct SchemaRegisterMiddleware {
    schema: Arc<RegisterSchema>,
    rmw: Mutex<()>,
    commands: SharedCommandSet,
    check_response_header: bool,
}

impl SchemaRegisterMiddleware {
    pub fn new(schema: Arc<RegisterSchema>) -> Self {
        Self {
            schema,
            rmw: Mutex::new(()),
            commands: Arc::default(),
            check_response_header: true,
        }
    }

    /// Run commands from `commands`. With `check_response_header`, a
    /// response whose magic, id or serial differ from the declared layout
    /// is rejected before any parameter is updated.
    pub fn with_commands(mut self, commands: SharedCommandSet, check_response_header: bool) -> Self {
        self.commands = commands;
        self.check_response_header = check_response_header;
        self
    }

    pub fn schema(&self) -> &RegisterSchema {
        &self.schema
    }

    /// Every field that documents a reset value, in schema order.
    pub fn defaults(&self) -> Vec<(String, FieldValue)> {
        self.schema
            .iter()
            .filter_map(|def| def.default.clone().map(|value| (def.name.clone(), value)))
            .collect()
    }

    fn field_bits(def: &RegisterDef, value: RegisterValue) -> Result<u32> {
        let value = match value {
            RegisterValue::Field(value) => value,
            raw @ RegisterValue::Raw(_) => FieldValue::Int(raw.as_word()?.into()),
        };
        Ok(def.encode(&value)?)
    }

    fn write_field(&self, name: &str, value: RegisterValue, next: RegisterNext<'_>) -> Result<WriteAck> {
        let def = self.schema.lookup(name)?;
        let raw = Self::field_bits(def, value)?;
        let _rmw;
        let word = if def.is_full_word() {
            raw
        } else {
            _rmw = self
                .rmw
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            let current = next.read(RegisterAddr::Numeric(def.address))?.as_word()?;
            def.insert(current, raw)
        };
        debug!(
            register = name,
            address = format_args!("{:#x}", def.address),
            word = format_args!("{word:#010x}"),
            "field write"
        );
        next.write(
            RegisterAddr::Numeric(def.address),
            RegisterValue::Raw(Bytes::copy_from_slice(&word.to_le_bytes())),
        )
    }

    fn lock_commands(&self) -> MutexGuard<'_, CommandSet> {
        self.commands
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn decode_field(def: &RegisterDef, value: RegisterValue) -> Result<RegisterValue> {
        let word = value.as_word()?;
        Ok(RegisterValue::Field(def.decode(def.extract(word))))
    }
}

impl Middleware for SchemaRegisterMiddleware {
    fn name(&self) -> &'static str {
        "schema"
    }

    fn write(&self, addr: RegisterAddr, value: RegisterValue, next: RegisterNext<'_>) -> Result<WriteAck> {
        match addr {
            RegisterAddr::Symbol(name) => self.write_field(&name, value, next),
            numeric => next.write(numeric, value),
        }
    }

    fn read(&self, addr: RegisterAddr, next: RegisterNext<'_>) -> Result<RegisterValue> {
        match addr {
            RegisterAddr::Symbol(name) => {
                let def = self.schema.lookup(&name)?;
                let word = next.read(RegisterAddr::Numeric(def.address))?;
                Self::decode_field(def, word)
            }
            numeric => next.read(numeric),
        }
    }

    fn execute(&self, command: &str, payload: &[u8], next: RegisterNext<'_>) -> Result<Bytes> {
        let (packet, response_len) = {
            let commands = self.lock_commands();
            if self.check_response_header {
                commands.response_template(command)?;
            }
            (
                commands.format_request(command, payload)?,
                commands.response_len(command)?,
            )
        };
        let response = next.exchange(Bytes::from(packet), response_len)?;

        let mut commands = self.lock_commands();
        if self.check_response_header {
            commands.check_response(command, &response)?;
        }
        let updated = commands.apply_response(command, &response)?;
        debug!(command, received = response.len(), ?updated, "command executed");
        Ok(response)
    }

    // Field writes may need a read first, so they go one at a time.
    fn bulk_write(
        &self,
        items: Vec<(RegisterAddr, RegisterValue)>,
        next: RegisterNext<'_>,
    ) -> Vec<Result<WriteAck>> {
        items
            .into_iter()
            .map(|(addr, value)| self.write(addr, value, next))
            .collect()
    }

    fn bulk_read(&self, addrs: Vec<RegisterAddr>, next: RegisterNext<'_>) -> Vec<Result<RegisterValue>> {
        // Resolve names up front so the transport sees one numeric batch.
        let resolved: Vec<Result<(u32, Option<&RegisterDef>)>> = addrs
            .iter()
            .map(|addr| match addr {
                RegisterAddr::Symbol(name) => {
                    let def = self.schema.lookup(name)?;
                    Ok((def.address, Some(def)))
                }
                RegisterAddr::Numeric(address) => Ok((*address, None)),
            })
            .collect();
        let batch: Vec<RegisterAddr> = resolved
            .iter()
            .filter_map(|entry| entry.as_ref().ok())
            .map(|(address, _)| RegisterAddr::Numeric(*address))
            .collect();
        let mut words = next.bulk_read(batch).into_iter();

        resolved
            .into_iter()
            .map(|entry| {
                let (_, def) = entry?;
                let word = words.next().unwrap_or_else(|| {
                    Err(crate::error::KitError::Validation(
                        "transport returned too few results".into(),
                    ))
                })?;
                match def {
                    Some(def) => Self::decode_field(def, word),
                    None => Ok(word),
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{CommandInterface, SimCommand};
    use crate::error::KitError;
    use crate::middleware::Chain;
    use instrlink_schema::FieldFormat;
    use std::collections::BTreeMap;

    fn schema() -> Arc<RegisterSchema> {
        let mut modes = BTreeMap::new();
        modes.insert("idle".to_string(), 0);
        modes.insert("run".to_string(), 2);
        Arc::new(
            RegisterSchema::from_definitions([
                RegisterDef::new("STATUS", 0x10).bits(0, 8).default_value(0i64),
                RegisterDef::new("MODE", 0x10)
                    .bits(8, 2)
                    .format(FieldFormat::Enumerated(modes)),
                RegisterDef::new("GAIN", 0x14).bits(0, 16).format(FieldFormat::Fixed {
                    frac_bits: 8,
                    signed: true,
                }),
                RegisterDef::new("WORD", 0x18),
            ])
            .unwrap(),
        )
    }

    fn setup() -> (Chain, SimCommand) {
        let chain = Chain::new(vec![Arc::new(SchemaRegisterMiddleware::new(schema()))]);
        let sim = SimCommand::new();
        sim.open(&"sim://schema".parse().unwrap()).unwrap();
        (chain, sim)
    }

    #[test]
    fn status_roundtrip() {
        let (chain, sim) = setup();
        chain
            .register_entry(&sim)
            .write("STATUS".into(), 5i64.into())
            .unwrap();
        let value = chain.register_entry(&sim).read("STATUS".into()).unwrap();
        assert_eq!(value, RegisterValue::Field(FieldValue::Int(5)));
        assert_eq!(sim.peek(0x10), 5);
    }

    #[test]
    fn narrow_field_write_keeps_neighbours() {
        let (chain, sim) = setup();
        sim.poke(0x10, 0xAB00_00FF);
        chain
            .register_entry(&sim)
            .write("MODE".into(), "run".into())
            .unwrap();
        assert_eq!(sim.peek(0x10), 0xAB00_02FF);
        assert_eq!(
            chain.register_entry(&sim).read("MODE".into()).unwrap(),
            RegisterValue::Field(FieldValue::Label("run".into()))
        );
        assert_eq!(
            chain.register_entry(&sim).read("STATUS".into()).unwrap(),
            RegisterValue::Field(FieldValue::Int(0xFF))
        );
    }

    #[test]
    fn concurrent_sibling_field_writes_all_land() {
        let flags = RegisterSchema::from_definitions(
            (0..32u8).map(|bit| RegisterDef::new(format!("FLAG{bit}"), 0x20).bits(bit, 1)),
        )
        .unwrap();
        let chain = Chain::new(vec![Arc::new(SchemaRegisterMiddleware::new(Arc::new(flags)))]);
        let sim = SimCommand::new();
        sim.open(&"sim://flags".parse().unwrap()).unwrap();

        for round in 0..50 {
            sim.poke(0x20, 0);
            std::thread::scope(|scope| {
                for worker in 0..4u8 {
                    let (chain, sim) = (&chain, &sim);
                    scope.spawn(move || {
                        for bit in (worker * 8)..(worker * 8 + 8) {
                            chain
                                .register_entry(sim)
                                .write(format!("FLAG{bit}").into(), 1i64.into())
                                .unwrap();
                        }
                    });
                }
            });
            assert_eq!(sim.peek(0x20), u32::MAX, "round {round} lost a field write");
        }
    }

    #[test]
    fn fixed_point_and_full_word() {
        let (chain, sim) = setup();
        let entry = chain.register_entry(&sim);
        entry.write("GAIN".into(), (-1.5f64).into()).unwrap();
        assert_eq!(
            entry.read("GAIN".into()).unwrap(),
            RegisterValue::Field(FieldValue::Float(-1.5))
        );

        // Full-word fields are written without a read.
        let before = sim.operations();
        entry
            .write("WORD".into(), RegisterValue::Raw(Bytes::from_static(&[1, 2, 3, 4])))
            .unwrap();
        assert_eq!(sim.operations(), before + 1);
        assert_eq!(sim.peek(0x18), 0x0403_0201);
    }

    #[test]
    fn unknown_name_and_out_of_range() {
        let (chain, sim) = setup();
        let entry = chain.register_entry(&sim);
        assert!(matches!(
            entry.write("NOPE".into(), 1i64.into()),
            Err(KitError::SchemaLookup(_))
        ));
        assert!(matches!(
            entry.write("STATUS".into(), 256i64.into()),
            Err(KitError::ValueRange { .. })
        ));
        assert_eq!(sim.operations(), 0);
    }

    #[test]
    fn numeric_addresses_pass_through() {
        let (chain, sim) = setup();
        let entry = chain.register_entry(&sim);
        entry
            .write(RegisterAddr::Numeric(0x40), RegisterValue::Raw(Bytes::from_static(&[9])))
            .unwrap();
        assert_eq!(sim.peek(0x40), 9);
        assert_eq!(
            entry.read(RegisterAddr::Numeric(0x40)).unwrap().as_word().unwrap(),
            9
        );
    }

    #[test]
    fn bulk_read_mixes_names_and_numbers() {
        let (chain, sim) = setup();
        sim.poke(0x10, 7);
        sim.poke(0x20, 9);
        let results = chain.register_entry(&sim).bulk_read(vec![
            "STATUS".into(),
            "MISSING".into(),
            RegisterAddr::Numeric(0x20),
        ]);
        assert_eq!(results[0].as_ref().unwrap(), &RegisterValue::Field(FieldValue::Int(7)));
        assert!(matches!(results[1], Err(KitError::SchemaLookup(_))));
        assert_eq!(results[2].as_ref().unwrap().as_word().unwrap(), 9);
    }

    const ICD: &str = r#"{
        "param": { "freq": ["double", 1.0e9], "locked": ["uint32", 0] },
        "command": {
            "tune": {
                "send": [["uint32", "0x5F5F5F5F"], ["uint32", "0x31000001"], ["uint32", 0],
                         ["uint32", 0], "freq"],
                "recv": [["uint32", "0xCFCFCFCF"], ["uint32", "0x31000001"], ["uint32", 0],
                         ["uint32", 0], ["uint32", 0], "locked"]
            }
        }
    }"#;

    fn command_chain(check: bool) -> (Chain, SharedCommandSet) {
        let commands: SharedCommandSet =
            Arc::new(Mutex::new(CommandSet::from_json_str(ICD).unwrap()));
        let stage = SchemaRegisterMiddleware::new(schema()).with_commands(Arc::clone(&commands), check);
        (Chain::new(vec![Arc::new(stage)]), commands)
    }

    fn reply_with(id: u32, locked: u32) -> SimCommand {
        let sim = SimCommand::new().with_responder(move |_, len| {
            let mut reply = Vec::with_capacity(len);
            for word in [0xCFCF_CFCFu32, id, 0, len as u32, 0, locked] {
                reply.extend_from_slice(&word.to_le_bytes());
            }
            reply
        });
        sim.open(&"sim://icd".parse().unwrap()).unwrap();
        sim
    }

    #[test]
    fn execute_sends_params_and_stores_reply() {
        let (chain, commands) = command_chain(true);
        commands.lock().unwrap().set_param("freq", 2.5e9).unwrap();
        let sim = reply_with(0x3100_0001, 1);

        let reply = chain.register_entry(&sim).execute("tune", &[]).unwrap();
        assert_eq!(reply.len(), 24);

        let sent = sim.last_packet().unwrap();
        assert_eq!(&sent[12..16], &24u32.to_le_bytes());
        assert_eq!(&sent[16..], &2.5e9f64.to_le_bytes());
        assert_eq!(
            commands.lock().unwrap().get_param("locked").unwrap(),
            instrlink_schema::ParamValue::Int(1)
        );
    }

    #[test]
    fn mismatched_reply_header_leaves_params_alone() {
        let (chain, commands) = command_chain(true);
        let sim = reply_with(0x3100_0002, 1);
        let err = chain.register_entry(&sim).execute("tune", &[]).unwrap_err();
        assert!(matches!(err, KitError::Transport(_)));
        assert_eq!(
            commands.lock().unwrap().get_param("locked").unwrap(),
            instrlink_schema::ParamValue::Int(0)
        );

        // Without the header check the same reply is accepted.
        let (chain, commands) = command_chain(false);
        chain.register_entry(&sim).execute("tune", &[]).unwrap();
        assert_eq!(
            commands.lock().unwrap().get_param("locked").unwrap(),
            instrlink_schema::ParamValue::Int(1)
        );
    }

    #[test]
    fn unknown_command_never_reaches_device() {
        let (chain, _) = command_chain(true);
        let sim = reply_with(0, 0);
        let err = chain.register_entry(&sim).execute("nope", &[]).unwrap_err();
        assert!(matches!(err, KitError::SchemaLookup(name) if name == "nope"));
        assert_eq!(sim.operations(), 0);
    }

    #[test]
    fn defaults_listed() {
        let middleware = SchemaRegisterMiddleware::new(schema());
        assert_eq!(
            middleware.defaults(),
            vec![("STATUS".to_string(), FieldValue::Int(0))]
        );
    }
}
