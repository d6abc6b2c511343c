pub mod cleaning;
pub mod color_utils;
pub mod config;
pub mod editor_io;
pub mod image_input;
pub mod inpaint;
pub mod model_access;
pub mod model_manager;
pub mod onnx_session;
pub mod output_manager;
pub mod processing;
pub mod region;
pub mod region_source;
pub mod segmentation;
