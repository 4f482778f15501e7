tonic::include_proto!("firedetection");

pub const FILE_DESCRIPTOR_SET: &[u8] = tonic::include_file_descriptor_set!("fire_detection");
