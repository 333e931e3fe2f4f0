//! Built-in type OIDs used by the client library and its callers.
//!
//! Values mirror `src/include/catalog/pg_type.h` of the server.

/// Object identifier.
pub type Oid = u32;

pub const INVALID_OID: Oid = 0;

pub const BOOLOID: Oid = 16;
pub const BYTEAOID: Oid = 17;
pub const CHAROID: Oid = 18;
pub const NAMEOID: Oid = 19;
pub const INT8OID: Oid = 20;
pub const INT2OID: Oid = 21;
pub const INT4OID: Oid = 23;
pub const TEXTOID: Oid = 25;
pub const OIDOID: Oid = 26;
pub const FLOAT4OID: Oid = 700;
pub const FLOAT8OID: Oid = 701;
pub const VARCHAROID: Oid = 1043;
pub const NUMERICOID: Oid = 1700;
