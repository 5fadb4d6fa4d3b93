use assertables::assert_contains;
use canmaster_common::{
    constants::object_ids,
    objects::{AccessType, DataType, ObjectDictionary, ObjectDictionaryError, ObjectEntry, Value},
    sdo::AbortCode,
    TimeOfDay,
};

fn test_dictionary() -> ObjectDictionary {
    let mut od = ObjectDictionary::communication_profile(4, 0x0002_0192, "Test drive");
    od.insert(ObjectEntry::new(0x6040, 0, "Controlword", 0u16).mappable());
    od.insert(
        ObjectEntry::new(0x6041, 0, "Statusword", 0u16)
            .access(AccessType::Ro)
            .mappable(),
    );
    od.insert(ObjectEntry::new(0x2000, 0, "Setpoint", 0i32).limits(-1000i32, 1000i32));
    od.insert(ObjectEntry::new(0x2001, 0, "Secret", 0u32).access(AccessType::Wo));
    od.insert(ObjectEntry::new(0x2002, 0, "Clock", TimeOfDay::EPOCH));
    od
}

#[test]
fn lookup_by_name() {
    let od = test_dictionary();
    assert_eq!((0x6040, 0), od.key_of("Controlword").unwrap());
    assert_eq!((0x1018, 1), od.key_of("Identity.Vendor-ID").unwrap());
    assert_eq!(
        (object_ids::TPDO_MAP_BASE, 0),
        od.key_of("TPDO1 mapping parameter.Number of mapped objects")
            .unwrap()
    );
    assert!(matches!(
        od.key_of("Nope"),
        Err(ObjectDictionaryError::NoSuchName { .. })
    ));
}

#[test]
fn server_side_writes_are_checked() {
    let mut od = test_dictionary();

    od.write_bytes(0x2000, 0, &(-5i32).to_le_bytes()).unwrap();
    assert_eq!(&Value::I32(-5), od.value(0x2000, 0).unwrap());

    let err = od.write_bytes(0x2000, 0, &2000i32.to_le_bytes()).unwrap_err();
    assert_eq!(AbortCode::ValueTooHigh, err.abort_code());
    // Rejected writes leave the value untouched
    assert_eq!(&Value::I32(-5), od.value(0x2000, 0).unwrap());

    let err = od.write_bytes(0x6041, 0, &[1, 0]).unwrap_err();
    assert_eq!(AbortCode::ReadOnly, err.abort_code());

    let err = od.write_bytes(0x6040, 0, &[1, 0, 0]).unwrap_err();
    assert_eq!(AbortCode::DataTypeMismatchLengthHigh, err.abort_code());

    let err = od.read_bytes(0x2001, 0).unwrap_err();
    assert_eq!(AbortCode::WriteOnly, err.abort_code());

    let err = od.read_bytes(0x3000, 0).unwrap_err();
    assert_eq!(AbortCode::NoSuchObject, err.abort_code());
}

#[test]
fn set_value_ignores_access_but_not_type() {
    let mut od = test_dictionary();
    od.set_value(0x6041, 0, Value::U16(0x0237)).unwrap();
    assert_eq!(&Value::U16(0x0237), od.value(0x6041, 0).unwrap());
    assert!(od.set_value(0x6041, 0, Value::U8(1)).is_err());
}

#[test]
fn defaults_are_restored() {
    let mut od = test_dictionary();
    od.set_value(0x2000, 0, Value::I32(7)).unwrap();
    od.set_value(0x1017, 0, Value::U16(100)).unwrap();
    od.reset_communication();
    assert_eq!(&Value::U16(0), od.value(0x1017, 0).unwrap());
    assert_eq!(&Value::I32(7), od.value(0x2000, 0).unwrap());
    od.reset_defaults();
    assert_eq!(&Value::I32(0), od.value(0x2000, 0).unwrap());
}

#[test]
fn communication_profile_contents() {
    let od = test_dictionary();
    // PDOs start disabled on their default COB-IDs
    assert_eq!(
        &Value::U32(0x8000_0184),
        od.value(object_ids::TPDO_COMM_BASE, 1).unwrap()
    );
    assert_eq!(
        &Value::U32(0x8000_0504),
        od.value(object_ids::RPDO_COMM_BASE + 3, 1).unwrap()
    );
    assert_eq!(
        DataType::TimeOfDay,
        od.get(0x2002, 0).unwrap().data_type
    );
    let names: Vec<&str> = od.iter().map(|e| e.name.as_str()).collect();
    assert_contains!(names, &"Manufacturer device name");
}

#[test]
fn strings_decode_to_first_nul() {
    let od = test_dictionary();
    let value = od
        .decode(object_ids::DEVICE_NAME, 0, b"Drive\0\0\0")
        .unwrap();
    assert_eq!(Value::VisibleString("Drive".into()), value);
}
