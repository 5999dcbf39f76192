use ini_core as ini;

use crate::data_type::DataType;
use crate::error::{AbortCode, ErrorCode};
use crate::prelude::*;
use crate::util;
use crate::value::Value;

/// Sub-index of the value cell (Var) or entry count (Array/Record).
pub const ODSI_VALUE: u8 = 0x00;
/// Synthesized structure descriptor, `(data_type << 8) | object_type`.
pub const ODSI_STRUCTURE: u8 = 0xFF;

// Communication profile entries the engine touches by index.
pub const ODI_DEVICE_TYPE: u16 = 0x1000;
pub const ODI_ERROR_REGISTER: u16 = 0x1001;
pub const ODI_PREDEFINED_ERROR_FIELD: u16 = 0x1003;
pub const ODI_SYNC_COB_ID: u16 = 0x1005;
pub const ODI_SYNC_PERIOD: u16 = 0x1006;
pub const ODI_TIME_COB_ID: u16 = 0x1012;
pub const ODI_EMCY_COB_ID: u16 = 0x1014;
pub const ODI_EMCY_INHIBIT_TIME: u16 = 0x1015;
pub const ODI_HEARTBEAT_CONSUMER_TIME: u16 = 0x1016;
pub const ODI_HEARTBEAT_PRODUCER_TIME: u16 = 0x1017;
pub const ODI_IDENTITY: u16 = 0x1018;
pub const ODI_SYNC_OVERFLOW: u16 = 0x1019;
pub const ODI_VERIFY_CONFIGURATION: u16 = 0x1020;
pub const ODI_NMT_INHIBIT_TIME: u16 = 0x102A;
pub const ODI_SDO_SERVER: u16 = 0x1200;
pub const ODI_SDO_CLIENT_LOW: u16 = 0x1280;
pub const ODI_SDO_CLIENT_HIGH: u16 = 0x12FF;
pub const ODI_RPDO_COMM_BASE: u16 = 0x1400;
pub const ODI_RPDO_MAPPING_BASE: u16 = 0x1600;
pub const ODI_TPDO_COMM_BASE: u16 = 0x1800;
pub const ODI_TPDO_MAPPING_BASE: u16 = 0x1A00;
pub const ODI_EXPECTED_CONFIGURATION_DATE: u16 = 0x1F26;
pub const ODI_EXPECTED_CONFIGURATION_TIME: u16 = 0x1F27;
pub const ODI_REDUNDANCY_CONFIGURATION: u16 = 0x1F60;
pub const ODI_NMT_STARTUP: u16 = 0x1F80;
pub const ODI_NMT_SLAVE_ASSIGNMENT: u16 = 0x1F81;
pub const ODI_REQUEST_NMT: u16 = 0x1F82;
pub const ODI_DEVICE_TYPE_IDENTIFICATION: u16 = 0x1F84;
pub const ODI_VENDOR_ID_IDENTIFICATION: u16 = 0x1F85;
pub const ODI_SERIAL_NUMBER_IDENTIFICATION: u16 = 0x1F88;
pub const ODI_BOOT_TIME: u16 = 0x1F89;
pub const ODI_NMT_FLYING_MASTER_TIMING_PARAMETERS: u16 = 0x1F90;

// 0x1F90 sub-indices.
pub const ODSI_FLYING_MASTER_TIMEOUT: u8 = 0x01;
pub const ODSI_FLYING_MASTER_DELAY: u8 = 0x02;
pub const ODSI_FLYING_MASTER_PRIORITY: u8 = 0x03;
pub const ODSI_FLYING_MASTER_PRIORITY_TIME_SLOT: u8 = 0x04;
pub const ODSI_FLYING_MASTER_DEVICE_TIME_SLOT: u8 = 0x05;
pub const ODSI_FLYING_MASTER_DETECT_TIME: u8 = 0x06;

// 0x1F60 sub-indices.
pub const ODSI_REDUNDANCY_HB_EVAL_POWER_ON: u8 = 0x02;
pub const ODSI_REDUNDANCY_HB_EVAL_RESET_COMM: u8 = 0x03;
pub const ODSI_REDUNDANCY_ERROR_THRESHOLD: u8 = 0x04;
pub const ODSI_REDUNDANCY_ERROR_COUNT: u8 = 0x05;

// 0x1200 sub-indices.
pub const ODSI_SDO_SERVER_RX_COB_ID: u8 = 0x01;
pub const ODSI_SDO_SERVER_TX_COB_ID: u8 = 0x02;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AccessType {
    Ro,
    Wo,
    Rw,
    Rwr,
    Rww,
    Const,
}

impl AccessType {
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "ro" => Some(AccessType::Ro),
            "wo" => Some(AccessType::Wo),
            "rw" => Some(AccessType::Rw),
            "rwr" => Some(AccessType::Rwr),
            "rww" => Some(AccessType::Rww),
            "const" => Some(AccessType::Const),
            _ => None,
        }
    }

    pub fn is_readable(&self) -> bool {
        !matches!(*self, AccessType::Wo)
    }

    pub fn is_writable(&self) -> bool {
        matches!(*self, AccessType::Wo | AccessType::Rw | AccessType::Rwr | AccessType::Rww)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ObjectType {
    Null = 0,
    Domain = 2,
    Deftype = 5,
    Defstruct = 6,
    Var = 7,
    Array = 8,
    Record = 9,
}

impl ObjectType {
    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            0 => Some(ObjectType::Null),
            2 => Some(ObjectType::Domain),
            5 => Some(ObjectType::Deftype),
            6 => Some(ObjectType::Defstruct),
            7 => Some(ObjectType::Var),
            8 => Some(ObjectType::Array),
            9 => Some(ObjectType::Record),
            _ => None,
        }
    }

    pub fn has_sub_objects(&self) -> bool {
        matches!(*self, ObjectType::Defstruct | ObjectType::Array | ObjectType::Record)
    }
}

/// A leaf cell: one addressable value with its access rules.
#[derive(Clone, Debug, PartialEq)]
pub struct SubObject {
    parameter_name: String,
    data_type: DataType,
    access_type: AccessType,
    pdo_mapping: bool,
    low_limit: Option<Value>,
    high_limit: Option<Value>,
    default_value: Value,
    value: Value,
}

impl SubObject {
    pub fn new(name: &str, data_type: DataType, access_type: AccessType, default_value: Value) -> Self {
        let mut parameter_name = String::from(name);
        parameter_name.truncate(241);
        SubObject {
            parameter_name,
            data_type,
            access_type,
            pdo_mapping: false,
            low_limit: None,
            high_limit: None,
            value: default_value.clone(),
            default_value,
        }
    }

    pub fn with_limits(mut self, low: Option<Value>, high: Option<Value>) -> Self {
        self.low_limit = low;
        self.high_limit = high;
        self
    }

    pub fn with_pdo_mapping(mut self, mappable: bool) -> Self {
        self.pdo_mapping = mappable;
        self
    }

    pub fn with_value(mut self, value: Value) -> Self {
        self.value = value;
        self
    }

    pub fn parameter_name(&self) -> &str {
        &self.parameter_name
    }
    pub fn data_type(&self) -> DataType {
        self.data_type
    }
    pub fn access_type(&self) -> AccessType {
        self.access_type
    }
    pub fn pdo_mapping(&self) -> bool {
        self.pdo_mapping
    }
    pub fn low_limit(&self) -> Option<&Value> {
        self.low_limit.as_ref()
    }
    pub fn high_limit(&self) -> Option<&Value> {
        self.high_limit.as_ref()
    }
    pub fn default_value(&self) -> &Value {
        &self.default_value
    }
    pub fn value(&self) -> &Value {
        &self.value
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        self.value.to_bytes()
    }

    /// Trusted store, used by the engine itself.
    pub fn set_value(&mut self, value: Value) {
        self.value = value;
    }

    /// Decode, range-check, store. The wire-facing mutation path.
    pub fn write_bytes(&mut self, raw: &[u8]) -> Result<(), AbortCode> {
        let value = Value::from_bytes(self.data_type, raw)?;
        value.check_limits(self.low_limit.as_ref(), self.high_limit.as_ref())?;
        self.value = value;
        Ok(())
    }

    pub fn reset(&mut self) {
        self.value = self.default_value.clone();
    }
}

/// One object dictionary entry: a plain variable or an aggregate of
/// sub-objects. Sub-index 0xFF always holds the synthesized structure
/// descriptor; aggregates keep sub-index 0 as their entry count.
#[derive(Clone, Debug)]
pub struct Object {
    parameter_name: String,
    object_type: ObjectType,
    data_type: DataType,
    sub_number: u8,
    obj_flags: u32,
    subs: HashMap<u8, SubObject>,
}

impl Object {
    fn bare(name: &str, object_type: ObjectType, data_type: DataType) -> Self {
        let mut parameter_name = String::from(name);
        parameter_name.truncate(241);
        Object {
            parameter_name,
            object_type,
            data_type,
            sub_number: 0,
            obj_flags: 0,
            subs: HashMap::new(),
        }
    }

    pub fn new_var(name: &str, data_type: DataType, access_type: AccessType, default_value: Value) -> Self {
        let mut obj = Object::bare(name, ObjectType::Var, data_type);
        obj.subs
            .insert(ODSI_VALUE, SubObject::new(name, data_type, access_type, default_value));
        obj.refresh_structure();
        obj
    }

    pub fn new_deftype(name: &str, bit_length: u16) -> Self {
        let mut obj = Object::bare(name, ObjectType::Deftype, DataType::Unsigned32);
        obj.subs.insert(
            ODSI_VALUE,
            SubObject::new(name, DataType::Unsigned32, AccessType::Ro, Value::Unsigned32(bit_length as u32)),
        );
        obj.refresh_structure();
        obj
    }

    pub fn new_domain(name: &str, default_value: Vec<u8>) -> Self {
        let mut obj = Object::bare(name, ObjectType::Domain, DataType::Domain);
        obj.subs.insert(
            ODSI_VALUE,
            SubObject::new(name, DataType::Domain, AccessType::Rw, Value::Domain(default_value)),
        );
        obj.refresh_structure();
        obj
    }

    pub fn new_array(name: &str, data_type: DataType) -> Self {
        let mut obj = Object::bare(name, ObjectType::Array, data_type);
        obj.refresh_structure();
        obj
    }

    pub fn new_record(name: &str, data_type: DataType) -> Self {
        let mut obj = Object::bare(name, ObjectType::Record, data_type);
        obj.refresh_structure();
        obj
    }

    pub fn with_sub(mut self, subindex: u8, sub: SubObject) -> Self {
        self.insert(subindex, sub);
        self
    }

    pub fn with_flags(mut self, obj_flags: u32) -> Self {
        self.obj_flags = obj_flags;
        self
    }

    pub fn parameter_name(&self) -> &str {
        &self.parameter_name
    }
    pub fn object_type(&self) -> ObjectType {
        self.object_type
    }
    pub fn data_type(&self) -> DataType {
        self.data_type
    }
    pub fn obj_flags(&self) -> u32 {
        self.obj_flags
    }
    pub fn sub_number(&self) -> u8 {
        self.sub_number
    }

    pub fn structure(&self) -> u32 {
        ((self.data_type as u32) << 8) | self.object_type as u32
    }

    /// Highest populated data sub-index (1..=0xFE), which by invariant is
    /// also the value of the count cell.
    pub fn highest_sub_index(&self) -> u8 {
        self.subs
            .keys()
            .copied()
            .filter(|&si| si != ODSI_VALUE && si != ODSI_STRUCTURE)
            .max()
            .unwrap_or(0)
    }

    fn refresh_structure(&mut self) {
        let structure = self.structure();
        self.subs.insert(
            ODSI_STRUCTURE,
            SubObject::new("structure", DataType::Unsigned32, AccessType::Const, Value::Unsigned32(structure)),
        );
        if self.object_type.has_sub_objects() {
            let count = self.highest_sub_index();
            self.sub_number = count;
            let count_cell = self
                .subs
                .remove(&ODSI_VALUE)
                .map(|cell| cell.with_value(Value::Unsigned8(count)))
                .unwrap_or_else(|| {
                    SubObject::new("Number of entries", DataType::Unsigned8, AccessType::Ro, Value::Unsigned8(count))
                });
            self.subs.insert(ODSI_VALUE, count_cell);
        }
    }

    pub fn insert(&mut self, subindex: u8, sub: SubObject) {
        self.subs.insert(subindex, sub);
        self.refresh_structure();
    }

    pub fn get(&self, subindex: u8) -> Option<&SubObject> {
        self.subs.get(&subindex)
    }

    pub fn get_mut(&mut self, subindex: u8) -> Option<&mut SubObject> {
        self.subs.get_mut(&subindex)
    }

    /// Value of the sub-index 0 cell.
    pub fn value(&self) -> Option<&Value> {
        self.subs.get(&ODSI_VALUE).map(|s| s.value())
    }

    pub fn sub_indices(&self) -> Vec<u8> {
        let mut keys: Vec<u8> = self.subs.keys().copied().collect();
        keys.sort_unstable();
        keys
    }

    pub fn reset(&mut self) {
        for sub in self.subs.values_mut() {
            sub.reset();
        }
    }
}

#[derive(Clone, Debug)]
pub struct ObjectDictionary {
    node_id: u8,
    index_to_object: HashMap<u16, Object>,
}

impl ObjectDictionary {
    pub fn new(node_id: u8) -> Self {
        ObjectDictionary { node_id, index_to_object: HashMap::new() }
    }

    pub fn node_id(&self) -> u8 {
        self.node_id
    }

    pub fn insert(&mut self, index: u16, mut object: Object) {
        object.refresh_structure();
        self.index_to_object.insert(index, object);
    }

    pub fn contains(&self, index: u16) -> bool {
        self.index_to_object.contains_key(&index)
    }

    pub fn get(&self, index: u16) -> Option<&Object> {
        self.index_to_object.get(&index)
    }

    pub fn get_mut(&mut self, index: u16) -> Option<&mut Object> {
        self.index_to_object.get_mut(&index)
    }

    pub fn remove(&mut self, index: u16) -> Option<Object> {
        self.index_to_object.remove(&index)
    }

    pub fn indices(&self) -> Vec<u16> {
        let mut keys: Vec<u16> = self.index_to_object.keys().copied().collect();
        keys.sort_unstable();
        keys
    }

    /// Addressing with the SDO abort taxonomy: unknown index and unknown
    /// sub-index get their dedicated codes.
    pub fn sub(&self, index: u16, subindex: u8) -> Result<&SubObject, AbortCode> {
        let object = self
            .index_to_object
            .get(&index)
            .ok_or(AbortCode::ObjectDoesNotExistInObjectDictionary)?;
        object.get(subindex).ok_or(AbortCode::SubIndexDoesNotExist)
    }

    pub fn sub_mut(&mut self, index: u16, subindex: u8) -> Result<&mut SubObject, AbortCode> {
        let object = self
            .index_to_object
            .get_mut(&index)
            .ok_or(AbortCode::ObjectDoesNotExistInObjectDictionary)?;
        object.get_mut(subindex).ok_or(AbortCode::SubIndexDoesNotExist)
    }

    /// Read path with access control (upload).
    pub fn read(&self, index: u16, subindex: u8) -> Result<&SubObject, AbortCode> {
        let sub = self.sub(index, subindex)?;
        if !sub.access_type().is_readable() {
            return Err(AbortCode::AttemptToReadWriteOnlyObject);
        }
        Ok(sub)
    }

    /// Write path with access control (download).
    pub fn write(
        &mut self,
        index: u16,
        subindex: u8,
        raw: &[u8],
        ignore_access_check: bool,
    ) -> Result<&SubObject, AbortCode> {
        let sub = self.sub_mut(index, subindex)?;
        if !ignore_access_check && !sub.access_type().is_writable() {
            return Err(AbortCode::AttemptToWriteReadOnlyObject);
        }
        sub.write_bytes(raw)?;
        Ok(self.sub(index, subindex)?)
    }

    /// Engine-internal store, bypassing access checks and limits.
    pub fn set_value(&mut self, index: u16, subindex: u8, value: Value) -> Result<(), AbortCode> {
        self.sub_mut(index, subindex)?.set_value(value);
        Ok(())
    }

    /// Unsigned view of an entry, `None` when absent or non-integer.
    pub fn unsigned_value(&self, index: u16, subindex: u8) -> Option<u64> {
        self.get(index)?.get(subindex)?.value().as_u64()
    }

    /// Restores every entry inside `range` from `defaults`; entries the
    /// defaults never had are dropped.
    pub fn reset_range(&mut self, defaults: &ObjectDictionary, range: core::ops::RangeInclusive<u16>) {
        let current: Vec<u16> = self
            .index_to_object
            .keys()
            .copied()
            .filter(|index| range.contains(index))
            .collect();
        for index in current {
            self.index_to_object.remove(&index);
        }
        for (index, object) in defaults.index_to_object.iter() {
            if range.contains(index) {
                self.index_to_object.insert(*index, object.clone());
            }
        }
    }

    pub fn from_eds(content: &str, node_id: u8) -> Result<Self, ErrorCode> {
        let mut od = ObjectDictionary::new(node_id);
        od.load_from_content(content)?;
        Ok(od)
    }

    fn load_from_content(&mut self, content: &str) -> Result<(), ErrorCode> {
        let mut current_section_name: Option<String> = None;
        let mut current_properties: HashMap<String, String> = HashMap::new();

        for item in ini::Parser::new(content) {
            match item {
                ini::Item::Section(name) => {
                    if let Some(section_name) = current_section_name.take() {
                        self.process_section(&section_name, &current_properties)?;
                        current_properties.clear();
                    }
                    current_section_name = Some(String::from(name.trim()));
                }
                ini::Item::Property(key, maybe_value) => {
                    let value = String::from(maybe_value.unwrap_or_default());
                    current_properties.insert(String::from(key.trim()), value);
                }
                _ => {}
            }
        }
        if let Some(section_name) = current_section_name {
            self.process_section(&section_name, &current_properties)?;
        }
        Ok(())
    }

    fn process_section(
        &mut self,
        section_name: &str,
        properties: &HashMap<String, String>,
    ) -> Result<(), ErrorCode> {
        let fail = |more_info: &str| ErrorCode::ProcessedSectionFailed {
            section_name: section_name.to_string(),
            more_info: more_info.to_string(),
        };

        if util::is_top(section_name) {
            let index = u16::from_str_radix(section_name, 16).map_err(|_| fail("bad index"))?;
            let name = properties.get("ParameterName").ok_or_else(|| fail("no ParameterName"))?;
            let ot_code: u32 = properties
                .get("ObjectType")
                .map(|s| util::parse_number(s))
                .unwrap_or(ObjectType::Var as u32);
            let object_type = ObjectType::from_u32(ot_code).unwrap_or(ObjectType::Var);
            let data_type = DataType::from_u32(
                properties.get("DataType").map(|s| util::parse_number(s)).unwrap_or(0),
            );

            match object_type {
                ObjectType::Var | ObjectType::Deftype | ObjectType::Domain => {
                    let sub = build_sub_object(properties, self.node_id, name, data_type)?;
                    let mut object = Object::bare(name, object_type, data_type);
                    object.insert(ODSI_VALUE, sub);
                    self.insert(index, object);
                }
                ObjectType::Array => {
                    self.insert(index, Object::new_array(name, data_type));
                }
                ObjectType::Record | ObjectType::Defstruct => {
                    let mut object = Object::bare(name, object_type, data_type);
                    object.refresh_structure();
                    self.insert(index, object);
                }
                ObjectType::Null => {}
            }
        } else if let Some((index, subindex)) = util::is_sub(section_name) {
            let name = properties.get("ParameterName").ok_or_else(|| fail("no ParameterName"))?;
            let data_type = DataType::from_u32(
                properties.get("DataType").map(|s| util::parse_number(s)).unwrap_or(0),
            );
            let sub = build_sub_object(properties, self.node_id, name, data_type)?;
            match self.index_to_object.get_mut(&index) {
                Some(object) => object.insert(subindex, sub),
                None => return Err(fail("sub-index section without object")),
            }
        }
        // Listing sections (MandatoryObjects etc.) and FileInfo/DeviceInfo
        // carry nothing the dictionary needs.
        Ok(())
    }
}

fn build_sub_object(
    properties: &HashMap<String, String>,
    node_id: u8,
    name: &str,
    data_type: DataType,
) -> Result<SubObject, ErrorCode> {
    let access_type = properties
        .get("AccessType")
        .and_then(|s| AccessType::from_str(s))
        .unwrap_or(AccessType::Rw);
    let pdo_mapping = properties
        .get("PDOMapping")
        .map(|s| util::parse_number::<u32>(s) != 0)
        .unwrap_or(false);

    let parse = |key: &str| -> Option<Value> {
        properties
            .get(key)
            .filter(|s| !s.trim().is_empty())
            .and_then(|s| Value::from_eds_str(data_type, s, node_id).ok())
    };

    let default_value = parse("DefaultValue").unwrap_or_else(|| Value::default_for(data_type));
    let value = parse("ParameterValue").unwrap_or_else(|| default_value.clone());
    let low = parse("LowLimit");
    let high = parse("HighLimit");

    Ok(SubObject::new(name, data_type, access_type, default_value)
        .with_limits(low, high)
        .with_pdo_mapping(pdo_mapping)
        .with_value(value))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_array() -> Object {
        Object::new_array("Consumer heartbeat time", DataType::Unsigned32)
            .with_sub(
                1,
                SubObject::new("Consumer heartbeat time", DataType::Unsigned32, AccessType::Rw, Value::Unsigned32(0)),
            )
            .with_sub(
                2,
                SubObject::new("Consumer heartbeat time", DataType::Unsigned32, AccessType::Rw, Value::Unsigned32(0)),
            )
    }

    #[test]
    fn test_structure_descriptor_synthesized() {
        let var = Object::new_var("Device type", DataType::Unsigned32, AccessType::Ro, Value::Unsigned32(0x000F_0191));
        let structure = var.get(ODSI_STRUCTURE).unwrap();
        assert_eq!(structure.value(), &Value::Unsigned32((0x07 << 8) | 7));
        assert_eq!(structure.access_type(), AccessType::Const);

        let arr = sample_array();
        assert_eq!(
            arr.get(ODSI_STRUCTURE).unwrap().value(),
            &Value::Unsigned32((0x07 << 8) | 8)
        );
    }

    #[test]
    fn test_array_count_tracks_highest_sub_index() {
        let mut arr = sample_array();
        assert_eq!(arr.value(), Some(&Value::Unsigned8(2)));
        assert_eq!(arr.sub_number(), 2);
        arr.insert(
            5,
            SubObject::new("entry", DataType::Unsigned32, AccessType::Rw, Value::Unsigned32(0)),
        );
        assert_eq!(arr.value(), Some(&Value::Unsigned8(5)));
        assert_eq!(arr.sub_number(), 5);
    }

    #[test]
    fn test_read_write_access_control() {
        let mut od = ObjectDictionary::new(2);
        od.insert(
            0x1000,
            Object::new_var("Device type", DataType::Unsigned32, AccessType::Ro, Value::Unsigned32(0x191)),
        );
        od.insert(
            0x1017,
            Object::new_var("Producer heartbeat time", DataType::Unsigned16, AccessType::Rw, Value::Unsigned16(0)),
        );
        od.insert(
            0x2000,
            Object::new_var("write-only thing", DataType::Unsigned8, AccessType::Wo, Value::Unsigned8(0)),
        );

        assert!(od.read(0x1000, 0).is_ok());
        assert_eq!(
            od.write(0x1000, 0, &[0, 0, 0, 0], false),
            Err(AbortCode::AttemptToWriteReadOnlyObject)
        );
        assert_eq!(od.read(0x2000, 0).err(), Some(AbortCode::AttemptToReadWriteOnlyObject));
        assert!(od.write(0x1017, 0, &[0xE8, 0x03], false).is_ok());
        assert_eq!(od.unsigned_value(0x1017, 0), Some(0x03E8));

        assert_eq!(od.read(0x5000, 0).err(), Some(AbortCode::ObjectDoesNotExistInObjectDictionary));
        assert_eq!(od.read(0x1000, 9).err(), Some(AbortCode::SubIndexDoesNotExist));
    }

    #[test]
    fn test_limit_enforcement() {
        let mut od = ObjectDictionary::new(1);
        od.insert(
            0x2001,
            Object::bare("bounded", ObjectType::Var, DataType::Unsigned16).with_sub(
                0,
                SubObject::new("bounded", DataType::Unsigned16, AccessType::Rw, Value::Unsigned16(10))
                    .with_limits(Some(Value::Unsigned16(5)), Some(Value::Unsigned16(100))),
            ),
        );
        assert!(od.write(0x2001, 0, &[50, 0], false).is_ok());
        assert_eq!(od.write(0x2001, 0, &[2, 0], false), Err(AbortCode::ValueWrittenTooLow));
        assert_eq!(od.write(0x2001, 0, &[0xFF, 0xFF], false), Err(AbortCode::ValueWrittenTooHigh));
    }

    #[test]
    fn test_reset_range() {
        let mut od = ObjectDictionary::new(1);
        od.insert(
            0x1017,
            Object::new_var("hb", DataType::Unsigned16, AccessType::Rw, Value::Unsigned16(0)),
        );
        od.insert(
            0x2000,
            Object::new_var("app", DataType::Unsigned8, AccessType::Rw, Value::Unsigned8(1)),
        );
        let defaults = od.clone();

        od.write(0x1017, 0, &[0xE8, 0x03], false).unwrap();
        od.write(0x2000, 0, &[9], false).unwrap();
        od.reset_range(&defaults, 0x1000..=0x1FFF);

        assert_eq!(od.unsigned_value(0x1017, 0), Some(0));
        assert_eq!(od.unsigned_value(0x2000, 0), Some(9));
    }

    const SAMPLE_EDS: &str = r#"
[FileInfo]
FileName=sample.eds
Description=sample device

[DeviceInfo]
VendorName=ACME

[MandatoryObjects]
SupportedObjects=2
1=0x1000
2=0x1017

[1000]
ParameterName=Device type
ObjectType=0x7
DataType=0x0007
AccessType=ro
DefaultValue=0x000F0191

[1017]
ParameterName=Producer heartbeat time
ObjectType=0x7
DataType=0x0006
AccessType=rw
DefaultValue=0

[1200]
ParameterName=Server SDO parameter
ObjectType=0x9
SubNumber=2

[1200sub0]
ParameterName=Number of entries
DataType=0x0005
AccessType=ro
DefaultValue=2

[1200sub1]
ParameterName=COB-ID Client->Server (rx)
DataType=0x0007
AccessType=ro
DefaultValue=$NODEID+0x600

[1200sub2]
ParameterName=COB-ID Server->Client (tx)
DataType=0x0007
AccessType=ro
DefaultValue=$NODEID+0x580

[1016]
ParameterName=Consumer heartbeat time
ObjectType=0x8
DataType=0x0007
SubNumber=2

[1016sub0]
ParameterName=Number of entries
DataType=0x0005
AccessType=ro
DefaultValue=1

[1016sub1]
ParameterName=Consumer heartbeat time
DataType=0x0007
AccessType=rw
DefaultValue=0x00050064
ParameterValue=0x000500C8
"#;

    #[test]
    fn test_eds_loading() {
        let od = ObjectDictionary::from_eds(SAMPLE_EDS, 2).unwrap();
        assert_eq!(od.unsigned_value(0x1000, 0), Some(0x000F_0191));
        assert_eq!(od.unsigned_value(0x1200, ODSI_SDO_SERVER_RX_COB_ID as u8), Some(0x602));
        assert_eq!(od.unsigned_value(0x1200, ODSI_SDO_SERVER_TX_COB_ID as u8), Some(0x582));
        // ParameterValue overrides DefaultValue for the live value.
        assert_eq!(od.unsigned_value(0x1016, 1), Some(0x0005_00C8));
        assert_eq!(od.sub(0x1016, 1).unwrap().default_value(), &Value::Unsigned32(0x0005_0064));
        // Count and structure invariants hold after loading.
        assert_eq!(od.unsigned_value(0x1016, 0), Some(1));
        assert_eq!(od.unsigned_value(0x1016, ODSI_STRUCTURE), Some((0x07 << 8) | 8));
        assert_eq!(od.unsigned_value(0x1200, ODSI_STRUCTURE), Some(9));
    }
}
