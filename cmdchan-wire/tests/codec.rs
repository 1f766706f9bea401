use cmdchan_wire::{decode_body, encode_body, Table, Value};

#[test]
fn request_shaped_body_roundtrips() {
    let mut ctrl = Table::new();
    ctrl.insert("_snon", "1");
    ctrl.insert("_sseq", 7u32);

    let mut data = Table::new();
    data.insert("type", "zone.list");

    let mut body = Table::new();
    body.insert("_ctrl", ctrl);
    body.insert("_data", data);

    let bytes = encode_body(&body).unwrap();
    let decoded = decode_body(&bytes).unwrap();

    assert_eq!(
        decoded.get_table("_ctrl").unwrap().get_str("_sseq"),
        Some("7")
    );
    assert_eq!(
        decoded.get_table("_data").unwrap().get_str("type"),
        Some("zone.list")
    );
}

#[test]
fn list_of_tables_roundtrips() {
    let mut zone_a = Table::new();
    zone_a.insert("name", "a.example.");
    let mut zone_b = Table::new();
    zone_b.insert("name", "b.example.");

    let mut body = Table::new();
    body.insert(
        "zones",
        Value::List(vec![Value::Table(zone_a), Value::Table(zone_b)]),
    );

    let bytes = encode_body(&body).unwrap();
    let decoded = decode_body(&bytes).unwrap();
    let zones = decoded.get("zones").unwrap().as_list().unwrap();
    assert_eq!(zones.len(), 2);
    assert_eq!(
        zones[0].as_table().unwrap().get_str("name"),
        Some("a.example.")
    );
    assert_eq!(
        zones[1].as_table().unwrap().get_str("name"),
        Some("b.example.")
    );
}
