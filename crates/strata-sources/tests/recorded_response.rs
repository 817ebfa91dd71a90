use strata_core::{RecordBatch, Value};
use strata_sources::parse_records;
use strata_storage::{decode_csv, encode_csv};

// trimmed from a pedestrian-counting search response
const RESPONSE: &str = r#"{
  "nhits": 3,
  "parameters": {"dataset": "pedestrian-counting-system-monthly-counts-per-hour"},
  "records": [
    {
      "datasetid": "pedestrian-counting-system-monthly-counts-per-hour",
      "recordid": "a1",
      "fields": {
        "timestamp": "2024-03-10T09:00:00+11:00",
        "locationid": 41,
        "sensor_name": "Bourke St",
        "total_of_directions": 1234,
        "location": {"lat": -37.8136, "lon": 144.9631}
      }
    },
    {
      "datasetid": "pedestrian-counting-system-monthly-counts-per-hour",
      "recordid": "a2",
      "fields": {
        "timestamp": "2024-03-10T10:00:00+11:00",
        "locationid": 42,
        "sensor_name": "Flinders St, South",
        "total_of_directions": 987,
        "occupancy": 0.35
      }
    },
    {
      "datasetid": "pedestrian-counting-system-monthly-counts-per-hour",
      "recordid": "a3",
      "fields": {
        "timestamp": "2024-03-10T11:00:00+11:00",
        "locationid": 43,
        "sensor_name": "Town Hall",
        "total_of_directions": 0,
        "occupancy": 2.0
      }
    }
  ]
}"#;

fn cell<'a>(batch: &'a RecordBatch, row: usize, column: &str) -> &'a Value {
    let idx = batch
        .column_index(column)
        .unwrap_or_else(|| panic!("missing column {column}"));
    &batch.rows()[row][idx]
}

#[test]
fn recorded_response_flattens_into_one_row_per_record() {
    let batch = parse_records(RESPONSE.as_bytes()).unwrap();

    assert_eq!(batch.len(), 3);
    assert_eq!(batch.columns().len(), 6);
    assert_eq!(cell(&batch, 0, "locationid"), &Value::Integer(41));
    assert_eq!(cell(&batch, 1, "sensor_name"), &Value::Text("Flinders St, South".into()));
    assert_eq!(cell(&batch, 1, "occupancy"), &Value::Real(0.35));
    // fields a record lacks come through as nulls
    assert_eq!(cell(&batch, 0, "occupancy"), &Value::Null);
    assert_eq!(cell(&batch, 2, "location"), &Value::Null);
    assert!(matches!(cell(&batch, 0, "location"), Value::Text(nested) if nested.contains("\"lat\"")));
}

#[test]
fn recorded_response_survives_a_landing_file() {
    let batch = parse_records(RESPONSE.as_bytes()).unwrap();

    let landed = decode_csv(&encode_csv(&batch).unwrap()).unwrap();

    assert_eq!(landed, batch);
    assert_eq!(cell(&landed, 2, "occupancy"), &Value::Real(2.0));
    assert_eq!(cell(&landed, 2, "total_of_directions"), &Value::Integer(0));
}

#[test]
fn a_response_without_records_is_an_empty_batch() {
    let batch = parse_records(br#"{"nhits": 0, "records": []}"#).unwrap();
    assert!(batch.is_empty());
    assert!(parse_records(b"<html>maintenance</html>").is_err());
}
