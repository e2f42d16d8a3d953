#[cfg(test)]
mod tests {
    use crate::adapter::simbus::SimBusAdapter;
    use crate::adapter::Adapter;
    use crate::endpoint::loopback::LoopbackHub;
    use crate::endpoint::Endpoint;
    use crate::runtime::Runtime;
    use crate::signal::fnv1a_hash;
    use crate::{BusError, BusResult, Model, ModelDesc, ModelSignalIndex};
    use cobus_config::{
        InstanceChannel, InstanceSpec, ModelDefinition, SignalConfig, SimulationSpec, VectorType,
    };
    use std::collections::HashMap;

    /* Test fixtures. */

    fn signal(name: &str) -> SignalConfig {
        SignalConfig {
            name: name.to_string(),
            annotations: HashMap::new(),
        }
    }

    fn signal_with(name: &str, annotations: &[(&str, serde_yaml::Value)]) -> SignalConfig {
        SignalConfig {
            name: name.to_string(),
            annotations: annotations
                .iter()
                .map(|(k, v)| (k.to_string(), v.clone()))
                .collect(),
        }
    }

    fn scalar_channel(name: &str, signals: Vec<SignalConfig>) -> InstanceChannel {
        InstanceChannel {
            name: name.to_string(),
            alias: None,
            expected_model_count: 1,
            vector_type: VectorType::Scalar,
            signals,
        }
    }

    fn binary_channel(name: &str, signals: Vec<SignalConfig>) -> InstanceChannel {
        InstanceChannel {
            vector_type: VectorType::Binary,
            ..scalar_channel(name, signals)
        }
    }

    fn instance(uid: u32, name: &str, channels: Vec<InstanceChannel>) -> InstanceSpec {
        InstanceSpec {
            uid,
            name: name.to_string(),
            model: ModelDefinition {
                name: "TestModel".to_string(),
                dynlib: None,
                kind: None,
                gateway: false,
            },
            channels,
        }
    }

    fn sim(instances: Vec<InstanceSpec>, step_size: f64, end_time: f64) -> SimulationSpec {
        SimulationSpec {
            transport: "loopback".to_string(),
            uri: String::new(),
            uid: 1,
            timeout: 0.1,
            step_size,
            end_time,
            mode_loopback: true,
            sequential_cosim: false,
            instances,
        }
    }

    /* Test models. */

    struct CounterModel {
        idx: Option<ModelSignalIndex>,
    }

    impl CounterModel {
        fn new() -> Box<dyn Model> {
            Box::new(Self { idx: None })
        }
    }

    impl Model for CounterModel {
        fn create(&mut self, desc: &mut ModelDesc) -> BusResult<()> {
            let idx = desc
                .index("data", Some("counter"))
                .ok_or_else(|| BusError::Config("Signal not found (data:counter)".to_string()))?;
            // Apply the initial_value annotation, if present.
            if let Some(text) = desc.sv[idx.vector].annotation(idx.signal.unwrap(), "initial_value")
            {
                let v: f64 = text.parse().unwrap_or(0.0);
                *desc.scalar_mut(&idx).unwrap() = v;
            }
            self.idx = Some(idx);
            Ok(())
        }

        fn step(
            &mut self,
            desc: &mut ModelDesc,
            model_time: &mut f64,
            stop_time: f64,
        ) -> BusResult<()> {
            let idx = self.idx.unwrap();
            *desc.scalar_mut(&idx).unwrap() += 1.0;
            *model_time = stop_time;
            Ok(())
        }
    }

    /// Applies a fixed function `f(inputs) -> outputs` over named scalars.
    struct FnModel<F>(F);

    impl<F> Model for FnModel<F>
    where
        F: FnMut(&mut ModelDesc),
    {
        fn step(
            &mut self,
            desc: &mut ModelDesc,
            model_time: &mut f64,
            stop_time: f64,
        ) -> BusResult<()> {
            (self.0)(desc);
            *model_time = stop_time;
            Ok(())
        }
    }

    fn fn_model<F: FnMut(&mut ModelDesc) + 'static>(f: F) -> Box<dyn Model> {
        Box::new(FnModel(f))
    }

    /// Pin a closure to the resolver signature (helps inference at the
    /// `&dyn ModelResolver` coercion site).
    fn resolver_fn<F>(f: F) -> F
    where
        F: Fn(&InstanceSpec) -> BusResult<Box<dyn Model>>,
    {
        f
    }

    /* Scenario: single counter. */

    #[test]
    fn test_single_counter_ten_steps() {
        let spec = sim(
            vec![instance(
                42,
                "counter_a",
                vec![scalar_channel(
                    "data",
                    vec![signal_with(
                        "counter",
                        &[("initial_value", serde_yaml::Value::from(42.0))],
                    )],
                )],
            )],
            0.005,
            0.050,
        );
        let resolver = resolver_fn(|_| Ok(CounterModel::new()));
        let mut rt = Runtime::new(spec, &resolver).unwrap();

        let mut t = 0.0;
        rt.step(&mut t, 0.050).unwrap();

        assert_eq!(t, 0.050);
        let sv = rt.signal_value("data", "counter").unwrap();
        assert_eq!(sv.current, 52.0);
        let am = rt.controller.adapter.model(42).unwrap();
        assert!((am.model_time - 0.050).abs() < 1e-12);
        rt.exit().unwrap();
    }

    /* Scenario: two-model loopback ping/pong. */

    #[test]
    fn test_two_model_loopback_ping_pong() {
        let channels = || {
            vec![scalar_channel(
                "data",
                vec![signal("ping"), signal("pong")],
            )]
        };
        let spec = sim(
            vec![
                instance(1, "model_a", channels()),
                instance(2, "model_b", channels()),
            ],
            0.005,
            0.050,
        );
        let ping_value = std::rc::Rc::new(std::cell::Cell::new(100.0));
        let ping_for_a = ping_value.clone();
        let resolver = resolver_fn(move |inst: &InstanceSpec| -> BusResult<Box<dyn Model>> {
            match inst.name.as_str() {
                "model_a" => {
                    let ping = ping_for_a.clone();
                    Ok(fn_model(move |desc| {
                        let idx = desc.index("data", Some("ping")).unwrap();
                        *desc.scalar_mut(&idx).unwrap() = ping.get();
                    }))
                }
                _ => Ok(fn_model(|desc| {
                    let ping = desc.index("data", Some("ping")).unwrap();
                    let pong = desc.index("data", Some("pong")).unwrap();
                    let v = desc.scalar(&ping).unwrap();
                    *desc.scalar_mut(&pong).unwrap() = v;
                })),
            }
        });
        let mut rt = Runtime::new(spec, &resolver).unwrap();

        let mut t = 0.0;
        rt.step(&mut t, 0.005).unwrap();
        assert_eq!(rt.signal_value("data", "pong").unwrap().current, 100.0);

        ping_value.set(-100.0);
        rt.step(&mut t, 0.010).unwrap();
        assert_eq!(rt.signal_value("data", "pong").unwrap().current, -100.0);
    }

    /* Scenario: binary append with buffer growth. */

    #[test]
    fn test_binary_append_reallocates() {
        let spec = sim(
            vec![instance(
                7,
                "writer",
                vec![binary_channel("binary", vec![signal("message")])],
            )],
            0.005,
            0.005,
        );
        let resolver = resolver_fn(|_: &InstanceSpec| -> BusResult<Box<dyn Model>> {
            Ok(fn_model(|desc| {
                let idx = desc.index("binary", Some("message")).unwrap();
                let (vi, si) = (idx.vector, idx.signal.unwrap());
                desc.sv[vi].reset(si);
                desc.sv[vi].append(si, b"count is 43\0");
            }))
        });
        let mut rt = Runtime::new(spec, &resolver).unwrap();

        let mut t = 0.0;
        rt.step(&mut t, 0.005).unwrap();

        let sv = rt.signal_value("binary", "message").unwrap();
        assert_eq!(sv.binary, b"count is 43\0".to_vec());
        assert_eq!(sv.binary.len(), 12);

        // The model-facing buffer grew beyond the payload.
        let mfc_buffer = rt.controller.models[0].desc.sv[0].buffer_size(0);
        assert!(mfc_buffer >= 13);
    }

    /* Scenario: linear transform round trip through the bus. */

    #[test]
    fn test_linear_transform_bus_view() {
        let transform: serde_yaml::Value =
            serde_yaml::from_str("linear:\n  factor: 2.0\n  offset: 1.0").unwrap();
        let spec = sim(
            vec![instance(
                9,
                "transformer",
                vec![scalar_channel(
                    "data",
                    vec![signal_with(
                        "x",
                        &[
                            ("initial_value", serde_yaml::Value::from(5.0)),
                            ("transform", transform),
                        ],
                    )],
                )],
            )],
            0.005,
            0.005,
        );
        let seen = std::rc::Rc::new(std::cell::Cell::new(0.0));
        let seen_in_model = seen.clone();
        let resolver = resolver_fn(move |_: &InstanceSpec| -> BusResult<Box<dyn Model>> {
            let seen = seen_in_model.clone();
            Ok(fn_model(move |desc| {
                let idx = desc.index("data", Some("x")).unwrap();
                seen.set(desc.scalar(&idx).unwrap());
                *desc.scalar_mut(&idx).unwrap() = 21.0;
            }))
        });
        let mut rt = Runtime::new(spec, &resolver).unwrap();

        let mut t = 0.0;
        rt.step(&mut t, 0.005).unwrap();

        // Model sees 5 * 2 + 1; bus sees (21 - 1) / 2.
        assert_eq!(seen.get(), 11.0);
        assert_eq!(rt.signal_value("data", "x").unwrap().current, 10.0);
    }

    /* Scenario: sequential cosim ordering. */

    #[test]
    fn test_sequential_cosim_step_order() {
        let channels = || vec![scalar_channel("data", vec![signal("out1"), signal("seen")])];
        let mut spec = sim(
            vec![
                instance(1, "m1", channels()),
                instance(2, "m2", channels()),
            ],
            0.005,
            0.010,
        );
        spec.sequential_cosim = true;

        let order = std::rc::Rc::new(std::cell::RefCell::new(Vec::<&'static str>::new()));
        let o1 = order.clone();
        let o2 = order.clone();
        let resolver = resolver_fn(move |inst: &InstanceSpec| -> BusResult<Box<dyn Model>> {
            match inst.name.as_str() {
                "m1" => {
                    let order = o1.clone();
                    Ok(fn_model(move |desc| {
                        order.borrow_mut().push("m1");
                        let idx = desc.index("data", Some("out1")).unwrap();
                        *desc.scalar_mut(&idx).unwrap() += 1.0;
                    }))
                }
                _ => {
                    let order = o2.clone();
                    Ok(fn_model(move |desc| {
                        order.borrow_mut().push("m2");
                        let out1 = desc.index("data", Some("out1")).unwrap();
                        let seen = desc.index("data", Some("seen")).unwrap();
                        let v = desc.scalar(&out1).unwrap();
                        *desc.scalar_mut(&seen).unwrap() = v;
                    }))
                }
            }
        });
        let mut rt = Runtime::new(spec, &resolver).unwrap();

        let mut t = 0.0;
        rt.step(&mut t, 0.010).unwrap();

        // M1 advanced fully to the target before M2 started.
        assert_eq!(&*order.borrow(), &["m1", "m1", "m2", "m2"]);
        // M2 observed M1's post-cycle values.
        assert_eq!(rt.signal_value("data", "seen").unwrap().current, 2.0);
    }

    /* Property: uid stability. */

    #[test]
    fn test_register_assigns_fnv_uids() {
        let spec = sim(
            vec![instance(
                3,
                "m",
                vec![scalar_channel("data", vec![signal("counter"), signal("other")])],
            )],
            0.005,
            0.005,
        );
        let resolver = resolver_fn(|_| Ok(fn_model(|_| {})));
        let rt = Runtime::new(spec, &resolver).unwrap();

        for name in ["counter", "other"] {
            let sv = rt.signal_value("data", name).unwrap();
            assert_eq!(sv.uid, fnv1a_hash(name));
            assert_ne!(sv.uid, 0);
        }
    }

    /* Property: delta minimality after a cycle. */

    #[test]
    fn test_no_pending_delta_after_cycle() {
        let spec = sim(
            vec![instance(
                4,
                "m",
                vec![scalar_channel("data", vec![signal("a"), signal("b")])],
            )],
            0.005,
            0.010,
        );
        let resolver = resolver_fn(|_: &InstanceSpec| -> BusResult<Box<dyn Model>> {
            Ok(fn_model(|desc| {
                let a = desc.index("data", Some("a")).unwrap();
                *desc.scalar_mut(&a).unwrap() += 3.5;
            }))
        });
        let mut rt = Runtime::new(spec, &resolver).unwrap();
        let mut t = 0.0;
        rt.step(&mut t, 0.005).unwrap();

        let channel = rt.controller.adapter.channel_by_name("data").unwrap();
        for sv in channel.values() {
            assert!(!sv.changed(), "signal '{}' still pending", sv.name);
        }
    }

    /* Property: Kahan time monotonicity. */

    #[test]
    fn test_kahan_time_progression() {
        let spec = sim(
            vec![instance(
                5,
                "m",
                vec![scalar_channel("data", vec![signal("x")])],
            )],
            0.005,
            10.0,
        );
        let resolver = resolver_fn(|_| Ok(fn_model(|_| {})));
        let mut rt = Runtime::new(spec, &resolver).unwrap();

        let n: u64 = 2000;
        let target = 0.005 * n as f64;
        let mut t = 0.0;
        rt.step(&mut t, target).unwrap();

        let expected = n as f64 * 0.005;
        let ulp = f64::EPSILON * expected;
        assert!(
            (rt.model_time - expected).abs() <= 4.0 * ulp,
            "model_time drifted: {} vs {}",
            rt.model_time,
            expected
        );
        // The per-model clock follows the same bound.
        let am = rt.controller.adapter.model(5).unwrap();
        assert!((am.model_time - expected).abs() <= 4.0 * ulp);
    }

    #[test]
    fn test_kahan_correction_survives_overshoot_break() {
        let spec = sim(
            vec![instance(
                8,
                "m",
                vec![scalar_channel("data", vec![signal("x")])],
            )],
            0.005,
            20.0,
        );
        let resolver = resolver_fn(|_| Ok(fn_model(|_| {})));
        let mut rt = Runtime::new(spec, &resolver).unwrap();

        // A target that is not a step multiple: the candidate sub-step to
        // 0.015 overshoots and must not perturb the correction term.
        let mut t = 0.0;
        rt.step(&mut t, 0.012).unwrap();
        assert!((rt.model_time - 0.010).abs() < 1e-12);

        // Continuing to a long target still meets the drift bound.
        let n: u64 = 2000;
        let target = 0.005 * n as f64;
        rt.step(&mut t, target).unwrap();
        let expected = n as f64 * 0.005;
        let ulp = f64::EPSILON * expected;
        assert!(
            (rt.model_time - expected).abs() <= 4.0 * ulp,
            "model_time drifted after resumed stepping: {} vs {}",
            rt.model_time,
            expected
        );
    }

    /* Property: uid collision is a configuration error. */

    #[test]
    fn test_register_rejects_uid_collision() {
        // "costarring" and "liquid" are a known FNV-1a 32 bit collision.
        let hub = LoopbackHub::new();
        let mut adapter = Adapter::new(Endpoint::Loopback(hub.endpoint(1, false)));
        adapter.connect(0.005).unwrap();
        adapter.create_model(1, "m");
        adapter
            .init_channel(
                1,
                "data",
                &["costarring".to_string(), "liquid".to_string()],
            )
            .unwrap();
        assert_eq!(fnv1a_hash("costarring"), fnv1a_hash("liquid"));
        assert!(matches!(adapter.register(1), Err(BusError::Config(_))));
    }

    /* Bus quorum and liveness (message adapters over the loopback hub). */

    fn message_adapter(hub: &LoopbackHub, uid: u32, signal: &str) -> Adapter {
        let mut adapter = Adapter::new(Endpoint::message(
            Box::new(hub.endpoint(uid, false)),
            uid,
            0.01,
        ));
        adapter.connect(0.005).unwrap();
        adapter.create_model(uid, &format!("model_{}", uid));
        adapter
            .init_channel(uid, "data", &[signal.to_string()])
            .unwrap();
        adapter
    }

    #[test]
    fn test_bus_quorum_and_termination() {
        let hub = LoopbackHub::new();
        let mut bus = SimBusAdapter::new(
            Endpoint::simbus(Box::new(hub.endpoint(1, true)), 1, 0.01),
            0.005,
        );
        bus.init_channel("data", 2, &["ping".to_string()]);

        let mut m1 = message_adapter(&hub, 42, "ping");
        let mut m2 = message_adapter(&hub, 43, "ping");

        // First model registers and becomes ready: no start yet.
        m1.register(42).unwrap();
        m1.ready(42).unwrap();
        assert!(bus.pump().unwrap());
        assert!(m1.endpoint.recv().unwrap().is_none());

        // Second model completes the quorum: start is issued to both.
        m2.register(43).unwrap();
        m2.ready(43).unwrap();
        assert!(bus.pump().unwrap());
        let stop1 = m1.start(42).unwrap();
        let stop2 = m2.start(43).unwrap();
        assert!((stop1 - 0.005).abs() < 1e-12);
        assert!((stop2 - 0.005).abs() < 1e-12);
        assert!((bus.bus_time - 0.0).abs() < 1e-12);

        // All models exit: the bus run loop terminates.
        m1.exit(42).unwrap();
        assert!(bus.pump().unwrap());
        m2.exit(43).unwrap();
        assert!(!bus.pump().unwrap());
    }

    #[test]
    fn test_bus_merges_and_redistributes_deltas() {
        let hub = LoopbackHub::new();
        let mut bus = SimBusAdapter::new(
            Endpoint::simbus(Box::new(hub.endpoint(1, true)), 1, 0.01),
            0.005,
        );
        bus.init_channel("data", 2, &["ping".to_string()]);

        let mut m1 = message_adapter(&hub, 42, "ping");
        let mut m2 = message_adapter(&hub, 43, "ping");
        m1.register(42).unwrap();
        m2.register(43).unwrap();

        // m1 publishes ping=100 with its ready delta.
        let ci = m1.channel_index("data").unwrap();
        let slot = m1.channel_mut(ci).find("ping").unwrap();
        m1.channel_mut(ci).get_mut(slot).final_value = 100.0;
        m1.ready(42).unwrap();
        m2.ready(43).unwrap();
        assert!(bus.pump().unwrap());

        m1.start(42).unwrap();
        m2.start(43).unwrap();

        // Both peers observe the merged value; nothing stays pending.
        for adapter in [&m1, &m2] {
            let channel = adapter.channel_by_name("data").unwrap();
            let sv = channel.get(channel.find("ping").unwrap());
            assert_eq!(sv.current, 100.0);
            assert!(!sv.changed());
        }
        let bus_channel = bus.channel_by_name("data").unwrap();
        let sv = bus_channel.get(bus_channel.find("ping").unwrap());
        assert_eq!(sv.current, 100.0);
    }

    #[test]
    fn test_bus_register_rejects_cross_model_uid_collision() {
        let hub = LoopbackHub::new();
        let mut bus = SimBusAdapter::new(
            Endpoint::simbus(Box::new(hub.endpoint(1, true)), 1, 0.01),
            0.005,
        );
        bus.init_channel("data", 2, &[]);

        // Each model registers one signal; the two names collide under
        // FNV-1a 32 bit, so the second register must be rejected before
        // uid-addressed deltas can conflate the slots.
        let mut m1 = message_adapter(&hub, 42, "costarring");
        let mut m2 = message_adapter(&hub, 43, "liquid");

        m1.register(42).unwrap();
        assert!(bus.pump().unwrap());

        m2.register(43).unwrap();
        assert!(matches!(bus.pump(), Err(BusError::Config(_))));
    }

    /* Gateway: behind-time synchronisation. */

    fn write_temp_yaml(prefix: &str, contents: &str) -> std::path::PathBuf {
        let mut dir = std::env::temp_dir();
        dir.push("cobus-tests");
        let _ = std::fs::create_dir_all(&dir);
        let nonce = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        let path = dir.join(format!("{}-{}.yaml", prefix, nonce));
        std::fs::write(&path, contents).expect("Failed to write temp file");
        path
    }

    const GATEWAY_SIM_YAML: &str = r#"
kind: Stack
metadata:
  name: gateway_sim
spec:
  connection:
    transport: loopback
  runtime:
    stepsize: 0.005
    endtime: 1.0
  models:
    - name: gateway
      uid: 10
      model: Gateway
      channels:
        - name: data
    - name: counter_a
      uid: 11
      model: Counter
      channels:
        - name: data
---
kind: Model
metadata:
  name: Gateway
spec:
  runtime:
    gateway: true
---
kind: Model
metadata:
  name: Counter
spec:
  runtime:
    kind: counter
---
kind: SignalGroup
metadata:
  name: data
spec:
  signals:
    - signal: counter
"#;

    fn gateway_resolver(inst: &InstanceSpec) -> BusResult<Box<dyn Model>> {
        if inst.model.gateway {
            Ok(fn_model(|_| {}))
        } else {
            Ok(fn_model(|desc| {
                let idx = desc.index("data", Some("counter")).unwrap();
                *desc.scalar_mut(&idx).unwrap() += 1.0;
            }))
        }
    }

    #[test]
    fn test_gateway_sync_advances_to_time() {
        let yaml = write_temp_yaml("gateway-sync", GATEWAY_SIM_YAML);
        let mut gw = crate::runtime::gateway::Gateway::setup(
            "gateway",
            &[yaml.clone()],
            None,
            None,
            &gateway_resolver,
        )
        .unwrap();

        gw.sync(0.0).unwrap();
        gw.sync(0.020).unwrap();
        assert!(gw.model_time() >= 0.020);
        let cycles = (gw.model_time() / 0.005).round();
        let counter = gw.runtime().signal_value("data", "counter").unwrap().current;
        assert!((counter - cycles).abs() < 1e-9);

        gw.exit().unwrap();
        let _ = std::fs::remove_file(yaml);
    }

    #[test]
    fn test_gateway_behind_does_not_advance() {
        let yaml = write_temp_yaml("gateway-behind", GATEWAY_SIM_YAML);
        let mut gw = crate::runtime::gateway::Gateway::setup(
            "gateway",
            &[yaml.clone()],
            None,
            None,
            &gateway_resolver,
        )
        .unwrap();

        gw.sync(0.020).unwrap();
        let before = gw.model_time();
        let err = gw.sync(0.005).unwrap_err();
        assert!(matches!(err, BusError::GatewayBehind { .. }));
        assert_eq!(gw.model_time(), before);

        let _ = std::fs::remove_file(yaml);
    }

    /* Codec attachment over a binary signal. */

    /// Length-prefixed frames with a node-id filter, enough to exercise
    /// the codec surface.
    #[derive(Debug, Default)]
    struct LpCodec {
        node_id: u8,
        staged: Vec<u8>,
    }

    impl crate::codec::Codec for LpCodec {
        fn read(
            &mut self,
            stream: &mut crate::signal::stream::BinarySignalStream,
        ) -> BusResult<Option<Vec<u8>>> {
            use crate::signal::stream::{ReadPos, SeekOp};
            let window = stream.read(ReadPos::Keep).to_vec();
            if window.len() < 2 {
                return Ok(None);
            }
            let node = window[0];
            let len = window[1] as usize;
            if window.len() < 2 + len {
                return Ok(None);
            }
            stream.seek(SeekOp::Cur((2 + len) as i64));
            if node == self.node_id {
                // RX filter: own frames are skipped.
                return self.read(stream);
            }
            Ok(Some(window[2..2 + len].to_vec()))
        }

        fn write(
            &mut self,
            _stream: &mut crate::signal::stream::BinarySignalStream,
            frame: &[u8],
        ) -> BusResult<usize> {
            self.staged.push(self.node_id);
            self.staged.push(frame.len() as u8);
            self.staged.extend_from_slice(frame);
            Ok(frame.len())
        }

        fn flush(
            &mut self,
            stream: &mut crate::signal::stream::BinarySignalStream,
        ) -> BusResult<()> {
            stream.write(&std::mem::take(&mut self.staged));
            Ok(())
        }

        fn truncate(
            &mut self,
            stream: &mut crate::signal::stream::BinarySignalStream,
        ) -> BusResult<()> {
            self.staged.clear();
            stream.seek(crate::signal::stream::SeekOp::Reset);
            Ok(())
        }

        fn config(&mut self, key: &str, value: &str) {
            if key == "node_id" {
                self.node_id = value.parse().unwrap_or(0);
            }
        }

        fn stat(&self, key: &str) -> Option<String> {
            (key == "node_id").then(|| self.node_id.to_string())
        }
    }

    fn codec_registry() -> crate::codec::CodecRegistry {
        let mut registry = crate::codec::CodecRegistry::new();
        registry.register("application/x-cobus-test", |mt| {
            let mut codec = LpCodec::default();
            if let Some(v) = mt.param("node_id") {
                codec.node_id = v.parse().unwrap_or(0);
            }
            Box::new(codec)
        });
        registry
    }

    #[test]
    fn test_codec_write_flush_read() {
        let mut sv = crate::SignalVector::new(
            "network",
            "network",
            "step",
            true,
            vec!["pdu".to_string()],
        );
        let mut ann = HashMap::new();
        ann.insert(
            "mime_type".to_string(),
            "application/x-cobus-test; node_id=1".to_string(),
        );
        sv.set_annotations(0, ann);
        sv.ensure_codec(0, &codec_registry()).unwrap();

        sv.codec_write(0, b"frame-a").unwrap();
        sv.codec_write(0, b"frame-b").unwrap();
        sv.codec_flush(0).unwrap();
        assert!(sv.length(0) > 0);

        // A node_id=1 reader filters its own frames out.
        sv.stream(0).seek(crate::signal::stream::SeekOp::Set(0));
        assert!(sv.codec_read(0).unwrap().is_none());

        // Reconfigure as a different node and rewind: both frames appear.
        {
            let codec = sv.codec(0).unwrap();
            assert_eq!(codec.stat("node_id").as_deref(), Some("1"));
            codec.config("node_id", "2");
        }
        sv.stream(0).seek(crate::signal::stream::SeekOp::Set(0));
        assert_eq!(sv.codec_read(0).unwrap().as_deref(), Some(&b"frame-a"[..]));
        assert_eq!(sv.codec_read(0).unwrap().as_deref(), Some(&b"frame-b"[..]));
        assert_eq!(sv.codec_read(0).unwrap(), None);

        // Truncate restarts the message.
        sv.codec_truncate(0).unwrap();
        assert_eq!(sv.length(0), 0);
    }

    /* Model errors abort the cycle with context. */

    #[test]
    fn test_model_step_error_aborts_cycle() {
        let spec = sim(
            vec![instance(
                6,
                "failing",
                vec![scalar_channel("data", vec![signal("x")])],
            )],
            0.005,
            0.010,
        );
        struct FailingModel;
        impl Model for FailingModel {
            fn step(&mut self, _: &mut ModelDesc, _: &mut f64, _: f64) -> BusResult<()> {
                Err(BusError::Config("sensor offline".to_string()))
            }
        }
        let resolver = resolver_fn(|_| Ok(Box::new(FailingModel) as Box<dyn Model>));
        let mut rt = Runtime::new(spec, &resolver).unwrap();

        let mut t = 0.0;
        let err = rt.step(&mut t, 0.005).unwrap_err();
        assert!(matches!(err, BusError::Model { .. }));
        assert!(err.to_string().contains("failing"));
    }
}
