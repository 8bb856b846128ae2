//! INDI XML Protocol definitions

/// INDI protocol version
pub const INDI_PROTOCOL_VERSION: &str = "1.7";

/// Standard INDI properties
///
/// See <https://indilib.org/develop/developer-manual/101-standard-properties.html>
pub mod standard_properties {
    /// Connection control switch
    pub const CONNECTION: &str = "CONNECTION";
    pub const CONNECT: &str = "CONNECT";
    pub const DISCONNECT: &str = "DISCONNECT";

    /// Device port
    pub const DEVICE_PORT: &str = "DEVICE_PORT";
    pub const PORT: &str = "PORT";
    pub const DEVICE_BAUD_RATE: &str = "DEVICE_BAUD_RATE";

    // General
    pub const TIME_UTC: &str = "TIME_UTC";
    pub const UTC: &str = "UTC";
    pub const OFFSET: &str = "OFFSET";
    pub const TIME_LST: &str = "TIME_LST";
    pub const GEOGRAPHIC_COORD: &str = "GEOGRAPHIC_COORD";
    pub const LAT: &str = "LAT";
    pub const LONG: &str = "LONG";
    pub const ELEV: &str = "ELEV";
    pub const ATMOSPHERE: &str = "ATMOSPHERE";
    pub const UPLOAD_MODE: &str = "UPLOAD_MODE";
    pub const UPLOAD_SETTINGS: &str = "UPLOAD_SETTINGS";
    pub const ACTIVE_DEVICES: &str = "ACTIVE_DEVICES";

    // Camera properties
    pub const CCD_EXPOSURE: &str = "CCD_EXPOSURE";
    pub const CCD_ABORT_EXPOSURE: &str = "CCD_ABORT_EXPOSURE";
    pub const CCD_FRAME: &str = "CCD_FRAME";
    pub const CCD_FRAME_TYPE: &str = "CCD_FRAME_TYPE";
    pub const CCD_FRAME_RESET: &str = "CCD_FRAME_RESET";
    pub const CCD_BINNING: &str = "CCD_BINNING";
    pub const CCD_COMPRESSION: &str = "CCD_COMPRESSION";
    pub const CCD_TEMPERATURE: &str = "CCD_TEMPERATURE";
    pub const CCD_COOLER: &str = "CCD_COOLER";
    pub const CCD_COOLER_POWER: &str = "CCD_COOLER_POWER";
    pub const CCD_INFO: &str = "CCD_INFO";
    pub const CCD_CFA: &str = "CCD_CFA";
    pub const CCD1: &str = "CCD1"; // BLOB property for image data

    // Mount properties
    pub const TELESCOPE_INFO: &str = "TELESCOPE_INFO";
    pub const EQUATORIAL_EOD_COORD: &str = "EQUATORIAL_EOD_COORD";
    pub const EQUATORIAL_COORD: &str = "EQUATORIAL_COORD";
    pub const TARGET_EOD_COORD: &str = "TARGET_EOD_COORD";
    pub const HORIZONTAL_COORD: &str = "HORIZONTAL_COORD";
    pub const ON_COORD_SET: &str = "ON_COORD_SET";
    pub const TELESCOPE_TRACK_STATE: &str = "TELESCOPE_TRACK_STATE";
    pub const TELESCOPE_TRACK_RATE: &str = "TELESCOPE_TRACK_RATE";
    pub const TELESCOPE_PARK: &str = "TELESCOPE_PARK";
    pub const TELESCOPE_PARK_POSITION: &str = "TELESCOPE_PARK_POSITION";
    pub const TELESCOPE_ABORT_MOTION: &str = "TELESCOPE_ABORT_MOTION";
    pub const TELESCOPE_MOTION_NS: &str = "TELESCOPE_MOTION_NS";
    pub const TELESCOPE_MOTION_WE: &str = "TELESCOPE_MOTION_WE";
    pub const TELESCOPE_TIMED_GUIDE_NS: &str = "TELESCOPE_TIMED_GUIDE_NS";
    pub const TELESCOPE_TIMED_GUIDE_WE: &str = "TELESCOPE_TIMED_GUIDE_WE";
    pub const TELESCOPE_SLEW_RATE: &str = "TELESCOPE_SLEW_RATE";
    pub const TELESCOPE_PIER_SIDE: &str = "TELESCOPE_PIER_SIDE";

    // Focuser properties
    pub const FOCUS_MOTION: &str = "FOCUS_MOTION";
    pub const FOCUS_SPEED: &str = "FOCUS_SPEED";
    pub const FOCUS_TIMER: &str = "FOCUS_TIMER";
    pub const ABS_FOCUS_POSITION: &str = "ABS_FOCUS_POSITION";
    pub const REL_FOCUS_POSITION: &str = "REL_FOCUS_POSITION";
    pub const FOCUS_ABORT_MOTION: &str = "FOCUS_ABORT_MOTION";
    pub const FOCUS_TEMPERATURE: &str = "FOCUS_TEMPERATURE";

    // Filter wheel properties
    pub const FILTER_SLOT: &str = "FILTER_SLOT";
    pub const FILTER_NAME: &str = "FILTER_NAME";

    // Dome properties
    pub const DOME_MEASUREMENTS: &str = "DOME_MEASUREMENTS";
    pub const DOME_SHUTTER: &str = "DOME_SHUTTER";
    pub const DOME_MOTION: &str = "DOME_MOTION";
    pub const ABS_DOME_POSITION: &str = "ABS_DOME_POSITION";
    pub const DOME_ABORT_MOTION: &str = "DOME_ABORT_MOTION";

    // Rotator properties
    pub const ABS_ROTATOR_ANGLE: &str = "ABS_ROTATOR_ANGLE";
    pub const ROTATOR_ANGLE: &str = "ROTATOR_ANGLE";

    // Weather and safety properties
    pub const WEATHER_STATUS: &str = "WEATHER_STATUS";
    pub const WEATHER_PARAMETERS: &str = "WEATHER_PARAMETERS";
    pub const SAFETY_STATUS: &str = "SAFETY_STATUS";
    pub const AUX_SAFETY: &str = "AUX_SAFETY";

    // Dust cap and flat panel properties
    pub const CAP_PARK: &str = "CAP_PARK";
    pub const FLAT_LIGHT_CONTROL: &str = "FLAT_LIGHT_CONTROL";
    pub const FLAT_LIGHT_INTENSITY: &str = "FLAT_LIGHT_INTENSITY";
}
