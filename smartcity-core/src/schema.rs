//! The fixed registry of stream definitions. Every stream the pipeline ingests is described here
//! once; the decoder, the columnar sink and the coordinator are all driven off this table.

use std::sync::Arc;

use arrow::datatypes::{DataType, Field, Schema, SchemaRef, TimeUnit};

/// Name of the column carrying the bus offset of every persisted record.
pub const OFFSET_COLUMN: &str = "_offset";

/// Timezone stamped on timestamp columns; event times are normalized to UTC.
pub(crate) const TIMESTAMP_TZ: &str = "UTC";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldType {
    String,
    Double,
    Integer,
    Timestamp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldSpec {
    pub name: &'static str,
    pub field_type: FieldType,
    pub nullable: bool,
}

const fn nullable(name: &'static str, field_type: FieldType) -> FieldSpec {
    FieldSpec {
        name,
        field_type,
        nullable: true,
    }
}

const fn required(name: &'static str, field_type: FieldType) -> FieldSpec {
    FieldSpec {
        name,
        field_type,
        nullable: false,
    }
}

/// Schema of one stream. Field order is the column order of the persisted files.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamDefinition {
    pub name: &'static str,
    pub fields: &'static [FieldSpec],
    /// The field that carries the event time, always a non-nullable timestamp.
    pub event_time_field: &'static str,
}

impl StreamDefinition {
    pub fn field(&self, name: &str) -> Option<&FieldSpec> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Arrow schema of the persisted files: the declared columns followed by the bus offset.
    pub fn arrow_schema(&self) -> SchemaRef {
        let mut fields: Vec<Field> = self
            .fields
            .iter()
            .map(|f| Field::new(f.name, arrow_type(f.field_type), f.nullable))
            .collect();
        fields.push(Field::new(OFFSET_COLUMN, DataType::Int64, false));
        Arc::new(Schema::new(fields))
    }
}

fn arrow_type(field_type: FieldType) -> DataType {
    match field_type {
        FieldType::String => DataType::Utf8,
        FieldType::Double => DataType::Float64,
        FieldType::Integer => DataType::Int32,
        FieldType::Timestamp => DataType::Timestamp(TimeUnit::Microsecond, Some(TIMESTAMP_TZ.into())),
    }
}

use FieldType::{Double, Integer, String as Str, Timestamp};

static VEHICLE_FIELDS: [FieldSpec; 10] = [
    nullable("id", Str),
    nullable("deviceId", Str),
    required("timestamp", Timestamp),
    nullable("location", Str),
    nullable("speed", Double),
    nullable("direction", Str),
    nullable("make", Str),
    nullable("model", Str),
    nullable("year", Integer),
    nullable("fuelType", Str),
];

static GPS_FIELDS: [FieldSpec; 6] = [
    nullable("id", Str),
    nullable("deviceId", Str),
    required("timestamp", Timestamp),
    nullable("speed", Double),
    nullable("direction", Str),
    nullable("vehicleType", Str),
];

static TRAFFIC_FIELDS: [FieldSpec; 6] = [
    nullable("id", Str),
    nullable("deviceId", Str),
    nullable("cameraId", Str),
    nullable("location", Str),
    required("timestamp", Timestamp),
    nullable("snapshot", Str),
];

static WEATHER_FIELDS: [FieldSpec; 10] = [
    nullable("id", Str),
    nullable("deviceId", Str),
    nullable("location", Str),
    required("timestamp", Timestamp),
    nullable("temperature", Double),
    nullable("weatherCondition", Str),
    nullable("precipitation", Double),
    nullable("windSpeed", Double),
    nullable("humidity", Integer),
    nullable("airQualityIndex", Double),
];

static EMERGENCY_FIELDS: [FieldSpec; 8] = [
    nullable("id", Str),
    nullable("deviceId", Str),
    nullable("incidentId", Str),
    nullable("type", Str),
    required("timestamp", Timestamp),
    nullable("location", Str),
    nullable("status", Str),
    nullable("description", Str),
];

static REGISTRY: [StreamDefinition; 5] = [
    StreamDefinition {
        name: "vehicle_data",
        fields: &VEHICLE_FIELDS,
        event_time_field: "timestamp",
    },
    StreamDefinition {
        name: "gps_data",
        fields: &GPS_FIELDS,
        event_time_field: "timestamp",
    },
    StreamDefinition {
        name: "traffic_data",
        fields: &TRAFFIC_FIELDS,
        event_time_field: "timestamp",
    },
    StreamDefinition {
        name: "weather_data",
        fields: &WEATHER_FIELDS,
        event_time_field: "timestamp",
    },
    StreamDefinition {
        name: "emergency_data",
        fields: &EMERGENCY_FIELDS,
        event_time_field: "timestamp",
    },
];

/// All stream definitions, in a stable order.
pub fn registry() -> &'static [StreamDefinition] {
    &REGISTRY
}

pub fn find(name: &str) -> Option<&'static StreamDefinition> {
    REGISTRY.iter().find(|d| d.name == name)
}
