//! Interface and endpoint descriptors for a stream
//!
//! A stream shows up to the host as a vendor-specific interface with one bulk
//! IN and one bulk OUT endpoint. Host tools match the interface by its class,
//! subclass and protocol, then talk to the two endpoints.

use usb_device::{
    class_prelude::DescriptorWriter,
    descriptor::descriptor_type,
    endpoint::{EndpointAddress, EndpointType},
    UsbDirection,
};

use crate::{MAX_ENDPOINTS, MAX_PACKET_SIZE};

/// Vendor-specific interface class
pub const USB_CLASS_VENDOR_SPEC: u8 = 0xFF;
/// Interface subclass of a serial stream
pub const USB_SUBCLASS_GOOGLE_SERIAL: u8 = 0x50;
/// Interface protocol of a serial stream
pub const USB_PROTOCOL_GOOGLE_SERIAL: u8 = 0x01;

const INTERFACE_LEN: usize = 9;
const ENDPOINT_LEN: usize = 7;

/// Polling interval reported for the IN endpoint, in frames
pub(crate) const IN_INTERVAL: u8 = 10;

/// The descriptors for one stream interface
///
/// ```
/// use usb_stream::StreamInterface;
///
/// const INTERFACE: StreamInterface = StreamInterface::new(0, 1, 4);
///
/// let mut buffer = [0; 64];
/// let len = INTERFACE.write_to(&mut buffer).unwrap();
/// assert_eq!(len, StreamInterface::LEN);
/// assert_eq!(buffer[1], 4); // INTERFACE
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-03", derive(defmt::Format))]
pub struct StreamInterface {
    interface: u8,
    endpoint: u8,
    string_index: u8,
}

impl StreamInterface {
    /// Total size of the interface descriptor and both endpoint descriptors
    pub const LEN: usize = INTERFACE_LEN + 2 * ENDPOINT_LEN;

    /// Describe interface number `interface`, using the bulk pair `endpoint`
    ///
    /// `string_index` names the interface. Use 0 for no name.
    ///
    /// # Panics
    ///
    /// Panics if `endpoint` is 0, or out of range.
    pub const fn new(interface: u8, endpoint: u8, string_index: u8) -> Self {
        assert!(endpoint != 0, "endpoint 0 belongs to the control pipe");
        assert!((endpoint as usize) < MAX_ENDPOINTS, "endpoint index out of range");
        StreamInterface {
            interface,
            endpoint,
            string_index,
        }
    }

    /// Returns the interface number
    pub const fn interface(&self) -> u8 {
        self.interface
    }

    /// The address of the IN endpoint, device to host
    pub fn in_address(&self) -> EndpointAddress {
        EndpointAddress::from_parts(self.endpoint as usize, UsbDirection::In)
    }

    /// The address of the OUT endpoint, host to device
    pub fn out_address(&self) -> EndpointAddress {
        EndpointAddress::from_parts(self.endpoint as usize, UsbDirection::Out)
    }

    /// The standard interface descriptor
    pub fn interface_descriptor(&self) -> [u8; INTERFACE_LEN] {
        [
            INTERFACE_LEN as u8,
            descriptor_type::INTERFACE,
            self.interface,
            0, // bAlternateSetting
            2, // bNumEndpoints
            USB_CLASS_VENDOR_SPEC,
            USB_SUBCLASS_GOOGLE_SERIAL,
            USB_PROTOCOL_GOOGLE_SERIAL,
            self.string_index,
        ]
    }

    /// The IN, then OUT, endpoint descriptors
    pub fn endpoint_descriptors(&self) -> [[u8; ENDPOINT_LEN]; 2] {
        [
            endpoint_descriptor(self.in_address(), IN_INTERVAL),
            endpoint_descriptor(self.out_address(), 0),
        ]
    }

    /// Write all three descriptors into `buffer`
    ///
    /// Returns the number of bytes written, or `None` if `buffer` is shorter
    /// than [`LEN`](StreamInterface::LEN).
    pub fn write_to(&self, buffer: &mut [u8]) -> Option<usize> {
        let buffer = buffer.get_mut(..Self::LEN)?;
        let (interface, endpoints) = buffer.split_at_mut(INTERFACE_LEN);
        interface.copy_from_slice(&self.interface_descriptor());
        for (dst, src) in endpoints
            .chunks_exact_mut(ENDPOINT_LEN)
            .zip(self.endpoint_descriptors())
        {
            dst.copy_from_slice(&src);
        }
        Some(Self::LEN)
    }

    /// Write all three descriptors with a `usb-device` descriptor writer
    ///
    /// Call this from your class's `get_configuration_descriptors`.
    pub fn write_descriptors(&self, writer: &mut DescriptorWriter) -> usb_device::Result<()> {
        let interface = self.interface_descriptor();
        writer.write(descriptor_type::INTERFACE, &interface[2..])?;
        for endpoint in self.endpoint_descriptors() {
            writer.write(descriptor_type::ENDPOINT, &endpoint[2..])?;
        }
        Ok(())
    }
}

fn endpoint_descriptor(address: EndpointAddress, interval: u8) -> [u8; ENDPOINT_LEN] {
    let [size_lo, size_hi] = (MAX_PACKET_SIZE as u16).to_le_bytes();
    [
        ENDPOINT_LEN as u8,
        descriptor_type::ENDPOINT,
        address.into(),
        EndpointType::Bulk.to_bm_attributes(),
        size_lo,
        size_hi,
        interval,
    ]
}
