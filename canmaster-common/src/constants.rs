//! Constants defining standard object indices and special values
//!
//!

/// Object indices for standard objects
pub mod object_ids {
    /// The device type object index
    pub const DEVICE_TYPE: u16 = 0x1000;
    /// The error register object index
    pub const ERROR_REGISTER: u16 = 0x1001;
    /// COB-ID of the SYNC message
    pub const SYNC_COB_ID: u16 = 0x1005;
    /// Communication cycle period (SYNC interval, in microseconds)
    pub const COMM_CYCLE_PERIOD: u16 = 0x1006;
    /// The Device Name object index
    pub const DEVICE_NAME: u16 = 0x1008;
    /// The hardware version object index
    pub const HARDWARE_VERSION: u16 = 0x1009;
    /// The software version object index
    pub const SOFTWARE_VERSION: u16 = 0x100A;
    /// Node guarding time, in milliseconds
    pub const GUARD_TIME: u16 = 0x100C;
    /// Node guarding life time factor
    pub const LIFE_TIME_FACTOR: u16 = 0x100D;
    /// Save objects command object index
    pub const SAVE_OBJECTS: u16 = 0x1010;
    /// Restore default parameters command object index
    pub const RESTORE_DEFAULTS: u16 = 0x1011;
    /// COB-ID of the emergency message
    pub const EMCY_COB_ID: u16 = 0x1014;
    /// The heartbeat consumer time object index
    pub const HEARTBEAT_CONSUMER_TIME: u16 = 0x1016;
    /// The heartbeat producer time object index
    pub const HEARTBEAT_PRODUCER_TIME: u16 = 0x1017;
    /// The identity object index
    pub const IDENTITY: u16 = 0x1018;

    /// The first RPDO communication parameter index. RPDO comm can be stored from 0x1400 to 0x15FF.
    pub const RPDO_COMM_BASE: u16 = 0x1400;
    ///  The first RPDO mapping parameter index. RPDO mappings can be stored from 0x1600 to 0x17FF;
    pub const RPDO_MAP_BASE: u16 = 0x1600;
    /// The first TPDO communication parameter index. TPDO comms can be stored from 0x1800 to 0x19FF.
    pub const TPDO_COMM_BASE: u16 = 0x1800;
    ///  The first TPDO mapping parameter index. TPDO mappings can be stored from 0x1A00 to 0x1BFF;
    pub const TPDO_MAP_BASE: u16 = 0x1A00;

    /// CiA-402 control word
    pub const CONTROLWORD: u16 = 0x6040;
    /// CiA-402 status word
    pub const STATUSWORD: u16 = 0x6041;
    /// CiA-402 requested mode of operation
    pub const MODES_OF_OPERATION: u16 = 0x6060;
    /// CiA-402 active mode of operation
    pub const MODES_OF_OPERATION_DISPLAY: u16 = 0x6061;
    /// CiA-402 bitmap of modes supported by the drive
    pub const SUPPORTED_DRIVE_MODES: u16 = 0x6502;
    /// CiA-402 polarity of position and velocity values
    pub const POLARITY: u16 = 0x607E;
    /// CiA-402 position encoder resolution
    pub const POSITION_ENCODER_RESOLUTION: u16 = 0x608F;
    /// CiA-402 velocity encoder resolution
    pub const VELOCITY_ENCODER_RESOLUTION: u16 = 0x6090;
    /// CiA-402 gear ratio
    pub const GEAR_RATIO: u16 = 0x6091;
    /// CiA-402 feed constant
    pub const FEED_CONSTANT: u16 = 0x6092;
    /// CiA-402 position factor
    pub const POSITION_FACTOR: u16 = 0x6093;
    /// CiA-402 velocity encoder factor
    pub const VELOCITY_ENCODER_FACTOR: u16 = 0x6094;
    /// CiA-402 velocity factor 1
    pub const VELOCITY_FACTOR_1: u16 = 0x6095;
    /// CiA-402 velocity factor 2
    pub const VELOCITY_FACTOR_2: u16 = 0x6096;
    /// CiA-402 acceleration factor
    pub const ACCELERATION_FACTOR: u16 = 0x6097;

    /// Returns true if the index lies in one of the PDO communication or mapping parameter ranges
    pub const fn is_pdo_parameter(index: u16) -> bool {
        index >= RPDO_COMM_BASE && index < TPDO_MAP_BASE + 0x200
    }
}

/// Special values used to access standard objects
pub mod values {
    /// Magic value used to trigger object storage by writing to object 0x1010
    pub const SAVE_CMD: u32 = 0x6576_6173;

    /// Magic value used to trigger a restore of defaults by writing to object 0x1011
    pub const LOAD_CMD: u32 = 0x6461_6F6C;
}
