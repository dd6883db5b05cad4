pub mod booking_config_dto;
pub mod reservation_dto;
pub mod session_cache_dto;
