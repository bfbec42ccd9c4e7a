use std::{
    sync::{Arc, Mutex},
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use netshrvar::{
    DriverBuilder, DriverHandle, EngineError,
    cnv::{CnvData, ConnectionStatus, DataQuality},
    config::MacroEnvironment,
    convert::ConvertError,
    driver::EomReason,
    services::LoopbackService,
    store::{
        AlarmCondition, AlarmSeverity, AsynStatus, ParamStatus, ParamStore, ParamTable,
        ParamValue,
    },
};
use tracing::level_filters::LevelFilter;
use tracing_subscriber::fmt::TestWriter;

fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(LevelFilter::TRACE)
        .with_writer(TestWriter::new())
        .try_init();
}

struct Harness {
    driver: DriverHandle<ParamTable>,
    service: Arc<LoopbackService>,
    store: Arc<Mutex<ParamTable>>,
}

impl Harness {
    async fn start(params: &str, paths: &[&str]) -> Self {
        Self::start_with(params, paths, |_| {}, Duration::from_millis(100)).await
    }

    async fn start_with(
        params: &str,
        paths: &[&str],
        setup: impl FnOnce(&LoopbackService),
        poll_interval: Duration,
    ) -> Self {
        init_logging();
        let service = Arc::new(LoopbackService::new());
        for path in paths {
            service.define(path);
        }
        setup(&service);
        let store = Arc::new(Mutex::new(ParamTable::new()));
        let document = format!(
            "<?xml version=\"1.0\"?>\n<netvar>\n<section name=\"test\">\n{params}\n</section>\n</netvar>"
        );
        let driver = DriverBuilder::from_document(&document, "test")
            .environment(MacroEnvironment::default())
            .poll_interval(poll_interval)
            .start(service.clone(), store.clone())
            .await
            .unwrap();
        Harness {
            driver,
            service,
            store,
        }
    }

    fn status(&self, name: &str) -> ParamStatus {
        let store = self.store.lock().unwrap();
        let id = store.find_param(name).unwrap();
        store.param_status(id).unwrap()
    }

    fn value(&self, name: &str) -> ParamValue {
        let store = self.store.lock().unwrap();
        let id = store.find_param(name).unwrap();
        store.value(id).unwrap().clone()
    }
}

/// `secs` seconds after 1990-01-01, in the service's two word encoding
fn service_time(secs: u64) -> CnvData {
    CnvData::array(&[2_713_996_800u64 + secs, 0])
}

fn epics_epoch_plus(secs: u64) -> SystemTime {
    UNIX_EPOCH + Duration::from_secs(631_152_000 + secs)
}

#[tokio::test]
async fn struct_fields_share_the_timestamp_field() {
    let h = Harness::start(
        r#"<param name="rec_ts" type="ftimestamp" access="R" netvar="\\localhost\lib\rec" field="0"/>
           <param name="rec_v" type="float64" access="R" netvar="\\localhost\lib\rec" field="1" ts_param="rec_ts"/>
           <param name="rec_n" type="int32" access="R" netvar="\\localhost\lib\rec" field="2"/>"#,
        &[r"\\localhost\lib\rec"],
    )
    .await;
    h.service.publish(
        r"\\localhost\lib\rec",
        CnvData::structure(vec![
            service_time(5000),
            CnvData::scalar(12.5f64),
            CnvData::scalar(3u16),
        ]),
    );
    let (ts, ts_time) = h.driver.read_f64("rec_ts").unwrap();
    assert_eq!(ts, 5000.0);
    assert_eq!(ts_time, epics_epoch_plus(5000));
    let (v, v_time) = h.driver.read_f64("rec_v").unwrap();
    assert_eq!(v, 12.5);
    assert_eq!(v_time, epics_epoch_plus(5000));
    let (n, n_time) = h.driver.read_i32("rec_n").unwrap();
    assert_eq!(n, 3);
    assert_eq!(n_time, epics_epoch_plus(5000));

    // Struct fields are views and cannot be written
    let err = h.driver.write_f64("rec_v", 1.0).unwrap_err();
    assert!(matches!(err.source, EngineError::StructProjection(_)));
}

#[tokio::test]
async fn arrays_round_trip_through_the_cache() {
    let h = Harness::start(
        r#"<param name="wave" type="float64array" access="R,W" netvar="//localhost/lib/wave"/>"#,
        &[r"\\localhost\lib\wave"],
    )
    .await;
    h.driver.write_array("wave", &[1.0f64, 2.0, 3.0]).unwrap();
    assert_eq!(
        h.service.writes(r"\\localhost\lib\wave"),
        vec![CnvData::array(&[1.0f64, 2.0, 3.0])]
    );

    let mut short = [0.0f64; 2];
    let read = h.driver.read_array("wave", &mut short).unwrap();
    assert_eq!(read.n_in, 2);
    assert_eq!(short, [1.0, 2.0]);

    let mut long = [0.0f64; 5];
    let read = h.driver.read_array("wave", &mut long).unwrap();
    assert_eq!(read.n_in, 3);
    assert_eq!(&long[..3], &[1.0, 2.0, 3.0]);

    let mut wrong = [0i32; 4];
    let err = h.driver.read_array("wave", &mut wrong).unwrap_err();
    assert_eq!(err.function, "readInt32Array");
    assert!(matches!(err.source, EngineError::WrongArrayKind { .. }));
    let err = h.driver.write_array("wave", &[1i32]).unwrap_err();
    assert_eq!(err.value, "1 elements");
}

#[tokio::test]
async fn alarm_set_binding_drives_base_alarm() {
    let base = r"\\localhost\lib\pressure";
    let h = Harness::start_with(
        r#"<param name="P" type="int32" access="R" netvar="\\localhost\lib\pressure"/>"#,
        &[base],
        |service| {
            for property in ["Enable", "Set", "Ack", "AckType", "level", "deadband"] {
                service.define(&format!(r"{base}\Alarms\Hi\{property}"));
            }
        },
        Duration::from_millis(100),
    )
    .await;
    let engine = h.driver.engine().unwrap();
    assert!(engine.registry().get("P").unwrap().has_connected_alarm());
    assert_eq!(
        engine.registry().get("P_Hi_level").unwrap().path(),
        r"\\localhost\lib\pressure\Alarms\Hi\level"
    );
    assert!(h.status("P").is_default());

    h.service
        .publish(&format!(r"{base}\Alarms\Hi\Set"), CnvData::scalar(true));
    assert_eq!(
        h.status("P"),
        ParamStatus::alarmed(AlarmCondition::High, AlarmSeverity::Minor)
    );
    // A generic in-alarm quality does not override the connected alarm
    h.service.publish(
        base,
        CnvData::scalar(9i32).with_quality(DataQuality::IN_ALARM),
    );
    assert_eq!(h.status("P").alarm, AlarmCondition::High);

    h.service
        .publish(&format!(r"{base}\Alarms\Hi\Set"), CnvData::scalar(false));
    assert!(h.status("P").is_default());

    // Alarm properties can be written
    h.driver.write_f64("P_Hi_level", 80.0).unwrap();
    assert_eq!(h.value("P_Hi_level"), ParamValue::Float64(80.0));
}

#[tokio::test]
async fn one_failed_binding_does_not_affect_others() {
    let h = Harness::start_with(
        r#"<param name="good" type="float64" access="R,W" netvar="\\localhost\lib\good"/>
           <param name="refused" type="float64" access="R,W" netvar="\\localhost\lib\refused"/>
           <param name="absent" type="string" access="SR" netvar="\\localhost\lib\absent"/>"#,
        &[r"\\localhost\lib\good", r"\\localhost\lib\refused"],
        |service| service.refuse_connections(r"\\localhost\lib\refused"),
        Duration::from_millis(100),
    )
    .await;
    h.driver.write_f64("good", 4.25).unwrap();
    assert_eq!(h.driver.read_f64("good").unwrap().0, 4.25);

    let err = h.driver.write_f64("refused", 1.0).unwrap_err();
    assert!(matches!(err.source, EngineError::NoWriter { .. }));
    assert!(
        err.to_string()
            .starts_with("writeFloat64: name=refused, value=1.000000, error=")
    );
    let err = h.driver.read_string("absent", 10).unwrap_err();
    assert!(matches!(err.source, EngineError::NoReader { .. }));
    let err = h.driver.read_f64("unknown").unwrap_err();
    assert!(matches!(err.source, EngineError::NoSuchBinding(_)));
}

#[tokio::test]
async fn incompatible_arrays_leave_the_store_untouched() {
    let h = Harness::start(
        r#"<param name="counts" type="int16array" access="R" netvar="\\localhost\lib\counts"/>"#,
        &[r"\\localhost\lib\counts"],
    )
    .await;
    h.service
        .publish(r"\\localhost\lib\counts", CnvData::array(&[1u16, 2, 65535]));
    assert_eq!(
        h.value("counts"),
        ParamValue::Array(netshrvar::convert::LocalArray::Int16(vec![1, 2, -1]))
    );

    h.service
        .publish(r"\\localhost\lib\counts", CnvData::array(&[1.0f32, 2.0]));
    h.service
        .publish(r"\\localhost\lib\counts", CnvData::array(&[1i32, 2]));
    let mut out = [0i16; 8];
    let read = h.driver.read_array("counts", &mut out).unwrap();
    assert_eq!(read.n_in, 3);
    assert_eq!(&out[..3], &[1, 2, -1]);
}

#[tokio::test]
async fn single_reads_fetch_on_demand() {
    let stamp = UNIX_EPOCH + Duration::from_secs(1_700_000_000);
    let h = Harness::start_with(
        r#"<param name="sr" type="int32" access="SR" netvar="\\localhost\lib\sr"/>"#,
        &[],
        |service| {
            service.define_with(
                r"\\localhost\lib\sr",
                CnvData::scalar(7i32).with_timestamp(stamp),
            )
        },
        Duration::from_millis(100),
    )
    .await;
    // Nothing is read until asked for
    assert_eq!(h.value("sr"), ParamValue::Undefined);
    assert_eq!(h.driver.read_i32("sr").unwrap(), (7, stamp));
    assert_eq!(h.store.lock().unwrap().timestamp(), stamp);

    h.service
        .publish(r"\\localhost\lib\sr", CnvData::scalar(8i32));
    assert_eq!(h.driver.read_i32("sr").unwrap().0, 8);
    // No new value: the cached one is returned
    assert_eq!(h.driver.read_i32("sr").unwrap().0, 8);
}

#[tokio::test]
async fn string_reads_report_truncation() {
    let h = Harness::start(
        r#"<param name="msg" type="string" access="R,W" netvar="\\localhost\lib\msg"/>"#,
        &[r"\\localhost\lib\msg"],
    )
    .await;
    assert_eq!(h.driver.write_string("msg", "hello world").unwrap(), 11);
    let read = h.driver.read_string("msg", 5).unwrap();
    assert_eq!(read.value, "hello");
    assert_eq!(read.eom, EomReason::COUNT | EomReason::END);
    let read = h.driver.read_string("msg", 40).unwrap();
    assert_eq!(read.value, "hello world");
    assert_eq!(read.eom, EomReason::END);

    // Numbers are never turned into text
    h.service
        .publish(r"\\localhost\lib\msg", CnvData::scalar(1.0f64));
    assert_eq!(h.driver.read_string("msg", 40).unwrap().value, "hello world");
}

#[tokio::test]
async fn poll_task_drains_buffered_reads() {
    let h = Harness::start_with(
        r#"<param name="queued" type="int32" access="BR,BW" netvar="\\localhost\lib\queued"/>"#,
        &[r"\\localhost\lib\queued"],
        |_| {},
        Duration::from_millis(10),
    )
    .await;
    let mut updates = h.store.lock().unwrap().subscribe();
    h.driver.write_i32("queued", 41).unwrap();
    h.service
        .publish(r"\\localhost\lib\queued", CnvData::scalar(42i32));

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if h.value("queued") == ParamValue::Int32(42) {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "Buffered value was never applied"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let update = updates.recv().await.unwrap();
    assert_eq!(update.name, "queued");
    assert_eq!(h.service.writes(r"\\localhost\lib\queued").len(), 1);
}

#[tokio::test]
async fn connection_status_is_mirrored() {
    let h = Harness::start(
        r#"<param name="v" type="float64" access="R" netvar="\\localhost\lib\v"/>"#,
        &[r"\\localhost\lib\v"],
    )
    .await;
    h.service.set_connection_status(
        r"\\localhost\lib\v",
        ConnectionStatus::Disconnected,
        None,
    );
    assert_eq!(h.status("v").status, AsynStatus::Disconnected);
    h.service
        .set_connection_status(r"\\localhost\lib\v", ConnectionStatus::Connected, None);
    assert!(h.status("v").is_default());

    h.service.publish(
        r"\\localhost\lib\v",
        CnvData::scalar(1.0f64).with_quality(DataQuality::BAD | DataQuality::TIMEOUT),
    );
    assert_eq!(h.status("v").status, AsynStatus::Error);
    h.service
        .publish(r"\\localhost\lib\v", CnvData::scalar(2.0f64));
    assert!(h.status("v").is_default());
}

#[tokio::test]
async fn report_describes_bindings() {
    let mut h = Harness::start_with(
        r#"<param name="q" type="int32" access="BR" netvar="\\localhost\lib\q"/>
           <param name="w" type="float32array" access="W" netvar="\\localhost\lib\w"/>"#,
        &[r"\\localhost\lib\q", r"\\localhost\lib\w"],
        |_| {},
        Duration::ZERO,
    )
    .await;
    let mut out = Vec::new();
    h.driver.report(&mut out).unwrap();
    let text = String::from_utf8(out).unwrap();
    assert!(text.contains("Section: test"));
    assert!(text.contains(r#""q" type=int32 access=BR path="\\localhost\lib\q""#));
    assert!(text.contains("buffered subscriber #"));
    assert!(text.contains("buffer=0/"));
    assert!(text.contains("last update=<never>"));

    h.driver.stop().await;
    let mut out = Vec::new();
    h.driver.report(&mut out).unwrap();
    assert!(String::from_utf8(out).unwrap().contains("<driver stopped"));
}

#[tokio::test]
async fn stopping_finalizes_the_service_once() {
    let mut h = Harness::start(
        r#"<param name="v" type="float64" access="R,W" netvar="\\localhost\lib\v"/>"#,
        &[r"\\localhost\lib\v"],
    )
    .await;
    assert_eq!(h.service.connection_count(r"\\localhost\lib\v"), 2);
    h.driver.stop().await;
    assert!(h.driver.is_stopped());
    assert_eq!(h.service.finish_count(), 1);
    assert_eq!(h.service.connection_count(r"\\localhost\lib\v"), 0);

    let err = h.driver.write_f64("v", 1.0).unwrap_err();
    assert!(matches!(err.source, EngineError::Stopped));
    let Harness { driver, service, .. } = h;
    drop(driver);
    assert_eq!(service.finish_count(), 1);
}

#[tokio::test]
async fn dropping_the_handle_finalizes_the_service() {
    let h = Harness::start(
        r#"<param name="v" type="float64" access="R" netvar="\\localhost\lib\v"/>"#,
        &[r"\\localhost\lib\v"],
    )
    .await;
    let Harness { driver, service, .. } = h;
    drop(driver);
    assert_eq!(service.finish_count(), 1);
}

#[tokio::test]
async fn config_file_name_is_expanded() {
    init_logging();
    let dir = std::env::temp_dir().join(format!("netshrvar-test-{}", std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(
        dir.join("netvar.xml"),
        r#"<netvar><section name="s"><param name="t" type="string" access="R" netvar="\\$(HOST=localhost)\lib\t"/></section></netvar>"#,
    )
    .unwrap();
    let env = MacroEnvironment::from_pairs([("CONFIG_DIR", dir.display().to_string())]);

    let service = Arc::new(LoopbackService::new());
    service.define_with(r"\\localhost\lib\t", CnvData::string("ready"));
    let store = Arc::new(Mutex::new(ParamTable::new()));
    let mut driver = DriverBuilder::new("${CONFIG_DIR}/netvar.xml", "s")
        .environment(env)
        .options(0x3)
        .start(service.clone(), store)
        .await
        .unwrap();
    assert_eq!(driver.read_string("t", 16).unwrap().value, "ready");

    let mut out = Vec::new();
    driver.report(&mut out).unwrap();
    let text = String::from_utf8(out).unwrap();
    assert!(text.contains("Config file: ${CONFIG_DIR}/netvar.xml"));
    assert!(text.contains(&format!("Expanded config file: {}", dir.join("netvar.xml").display())));
    assert!(text.contains("Options: 0x3"));
    driver.stop().await;
    std::fs::remove_dir_all(&dir).unwrap();

    let missing = DriverBuilder::new("${CONFIG_DIR}/netvar.xml", "s")
        .environment(MacroEnvironment::default())
        .start(Arc::new(LoopbackService::new()), Arc::new(Mutex::new(ParamTable::new())))
        .await;
    assert!(missing.is_err());
}

#[tokio::test]
async fn out_of_range_timestamps_are_rejected() {
    let h = Harness::start_with(
        r#"<param name="t" type="timestamp" access="SR" netvar="\\localhost\lib\t"/>
           <param name="ft" type="ftimestamp" access="SR" netvar="\\localhost\lib\ft"/>
           <param name="init_t" type="timestamp" access="R" netvar="\\localhost\lib\init_t"/>
           <param name="init_ft" type="ftimestamp" access="R" netvar="\\localhost\lib\init_ft"/>
           <param name="ok" type="float64" access="R" netvar="\\localhost\lib\ok"/>"#,
        &[],
        |service| {
            service.define_with(r"\\localhost\lib\t", CnvData::array(&[1u64 << 62, 0]));
            service.define_with(r"\\localhost\lib\ft", CnvData::array(&[1u64 << 63, 0]));
            service.define_with(r"\\localhost\lib\init_t", CnvData::array(&[1u64 << 63, 0]));
            service.define_with(r"\\localhost\lib\init_ft", CnvData::array(&[1u64 << 62, 0]));
            service.define_with(r"\\localhost\lib\ok", CnvData::scalar(2.0f64));
        },
        Duration::from_millis(100),
    )
    .await;
    // Bad initial values are skipped without affecting other bindings
    assert_eq!(h.value("init_t"), ParamValue::Undefined);
    assert_eq!(h.value("init_ft"), ParamValue::Undefined);
    assert_eq!(h.driver.read_f64("ok").unwrap().0, 2.0);

    let err = h.driver.read_string("t", 40).unwrap_err();
    assert!(matches!(
        err.source,
        EngineError::Convert(ConvertError::TimestampRange(_))
    ));
    let err = h.driver.read_f64("ft").unwrap_err();
    assert!(matches!(
        err.source,
        EngineError::Convert(ConvertError::TimestampRange(_))
    ));

    h.service
        .publish(r"\\localhost\lib\init_ft", CnvData::array(&[1u64 << 63, 1]));
    assert_eq!(h.value("init_ft"), ParamValue::Undefined);
    h.service
        .publish(r"\\localhost\lib\init_ft", service_time(20));
    assert_eq!(h.value("init_ft"), ParamValue::Float64(20.0));

    h.service.publish(r"\\localhost\lib\t", service_time(10));
    assert_eq!(
        h.driver.read_string("t", 40).unwrap().value,
        "1990-01-01T00:00:10.000000"
    );
}

#[tokio::test]
async fn scalar_writes_must_match_the_param_type() {
    let h = Harness::start(
        r#"<param name="n" type="int32" access="R,W" netvar="\\localhost\lib\n"/>
           <param name="s" type="string" access="R,W" netvar="\\localhost\lib\s"/>"#,
        &[r"\\localhost\lib\n", r"\\localhost\lib\s"],
    )
    .await;
    let err = h.driver.write_f64("n", 2.5).unwrap_err();
    assert_eq!(err.function, "writeFloat64");
    assert!(matches!(err.source, EngineError::WrongKind { .. }));
    let err = h.driver.write_string("n", "3").unwrap_err();
    assert!(matches!(err.source, EngineError::WrongKind { .. }));
    let err = h.driver.write_i32("s", 3).unwrap_err();
    assert!(matches!(err.source, EngineError::WrongKind { .. }));

    // Nothing reached the service or the store
    assert!(h.service.writes(r"\\localhost\lib\n").is_empty());
    assert!(h.service.writes(r"\\localhost\lib\s").is_empty());
    assert_eq!(h.value("n"), ParamValue::Undefined);

    h.driver.write_i32("n", 3).unwrap();
    assert_eq!(
        h.service.writes(r"\\localhost\lib\n"),
        vec![CnvData::scalar(3i32)]
    );
    assert_eq!(h.value("n"), ParamValue::Int32(3));
}

#[tokio::test]
async fn empty_arrays_are_ignored() {
    let h = Harness::start(
        r#"<param name="wave" type="float64array" access="R" netvar="\\localhost\lib\wave"/>"#,
        &[r"\\localhost\lib\wave"],
    )
    .await;
    h.service
        .publish(r"\\localhost\lib\wave", CnvData::array(&[1.0f64, 2.0]));
    h.service
        .publish(r"\\localhost\lib\wave", CnvData::array::<f64>(&[]));
    h.service.publish(
        r"\\localhost\lib\wave",
        CnvData::array_with_dimensions::<f64>(&[], vec![3, 0]),
    );
    let mut out = [0.0f64; 4];
    let read = h.driver.read_array("wave", &mut out).unwrap();
    assert_eq!(read.n_in, 2);
    assert_eq!(&out[..2], &[1.0, 2.0]);
}
